//! # Selector: priority- and capability-aware backend choice
//!
//! ## Responsibility
//! Given the registry and a task, pick the first eligible backend
//! (enabled, healthy, under its cap) in priority order for which the
//! capability matcher finds a compatible adaptation.
//!
//! ## Guarantees
//! - Deterministic: for a fixed registration order and a fixed
//!   health/quota snapshot the same backend is chosen
//! - Stable: registration order breaks ties within a tier
//! - Sound: the returned [`Adaptation`] satisfies the chosen backend's
//!   declared capabilities
//!
//! ## NOT Responsible For
//! - Reserving quota (see: `dispatcher`)
//! - Mutating the task (the dispatcher applies the adaptation)

use crate::matcher::{self, Adaptation, Incompatibility};
use crate::registry::{BackendId, BackendRegistry};
use crate::task::GenerationTask;
use std::collections::HashSet;

/// The selector's pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Chosen slot.
    pub backend: BackendId,
    /// Parameters to submit with.
    pub adaptation: Adaptation,
}

/// Why nothing was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoCandidate {
    /// Eligible backends that were rejected, with the reason.
    pub rejected: Vec<(String, Incompatibility)>,
}

impl NoCandidate {
    /// One-line description for error messages.
    pub fn describe(&self) -> String {
        if self.rejected.is_empty() {
            return "no enabled, healthy backend with free capacity".to_string();
        }
        let reasons: Vec<String> = self
            .rejected
            .iter()
            .map(|(name, why)| format!("{name}: {why}"))
            .collect();
        format!("no compatible backend ({})", reasons.join("; "))
    }
}

/// Eligible slots sorted by priority tier, registration order within a tier.
pub fn candidates(registry: &BackendRegistry, exclude: &HashSet<BackendId>) -> Vec<BackendId> {
    let mut ids: Vec<BackendId> = registry
        .iter()
        .filter(|(id, slot)| !exclude.contains(id) && slot.is_eligible())
        .map(|(id, _)| id)
        .collect();
    // sort_by_key is stable, so registration order survives within a tier.
    ids.sort_by_key(|&id| registry.get(id).map(|s| s.priority()));
    ids
}

/// Pick a backend for `task`, skipping everything in `exclude`.
///
/// # Arguments
/// * `registry`: All registrations with their live state.
/// * `task`: The task as requested (not yet adapted).
/// * `exclude`: Backends already tried in this dispatch chain.
///
/// # Returns
/// - `Ok(Selection)`: the first compatible candidate
/// - `Err(NoCandidate)`: no eligible backend is compatible
///
/// # Panics
///
/// This function never panics.
pub fn select(
    registry: &BackendRegistry,
    task: &GenerationTask,
    exclude: &HashSet<BackendId>,
) -> Result<Selection, NoCandidate> {
    let mut rejected = Vec::new();
    for id in candidates(registry, exclude) {
        let Some(slot) = registry.get(id) else {
            continue;
        };
        match matcher::check(task, slot.adapter().capabilities()) {
            Ok(adaptation) => {
                tracing::debug!(
                    task_id = %task.task_id,
                    backend = slot.name(),
                    priority = %slot.priority(),
                    "backend selected"
                );
                return Ok(Selection {
                    backend: id,
                    adaptation,
                });
            }
            Err(why) => {
                tracing::debug!(
                    task_id = %task.task_id,
                    backend = slot.name(),
                    reason = %why,
                    "backend incompatible"
                );
                rejected.push((slot.name().to_string(), why));
            }
        }
    }
    Err(NoCandidate { rejected })
}
