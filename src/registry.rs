//! # Backend registry: arena of registrations and their live state
//!
//! ## Responsibility
//! Own every registered adapter together with its static registration
//! (name, priority tier, enabled flag, concurrency cap) and its two pieces
//! of live shared state: the `healthy` flag and the in-flight count.
//!
//! ## Guarantees
//! - Bounded: a slot's active count stays within `[0, max_concurrent]`
//!   under any interleaving of [`BackendSlot::try_reserve`] and guard drops
//! - Guaranteed release: [`QuotaGuard`] releases its slot on drop, so a
//!   panicking or erroring adapter call cannot leak quota
//! - Stable order: slots are kept in registration order
//!
//! ## NOT Responsible For
//! - Deciding which backend to use (see: `selector`)
//! - Probing health (see: `health`)

use crate::backend::{HealthReport, VideoBackend};
use crate::metrics;
use crate::DispatchError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Priority tier; lower tiers are tried first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Preferred backends.
    Primary,
    /// Used when no primary can take the task.
    Secondary,
    /// Last resort.
    Fallback,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Index of a slot in the registry.
pub type BackendId = usize;

/// Result of the most recent health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    /// Probe detail text.
    pub detail: String,
    /// When the probe finished.
    pub checked_at: DateTime<Utc>,
}

/// One registered backend.
pub struct BackendSlot {
    name: String,
    priority: Priority,
    max_concurrent: usize,
    enabled: AtomicBool,
    healthy: AtomicBool,
    active: AtomicUsize,
    last_health: Mutex<Option<HealthRecord>>,
    adapter: Arc<dyn VideoBackend>,
}

impl BackendSlot {
    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority tier.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Concurrency cap.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// The adapter.
    pub fn adapter(&self) -> &Arc<dyn VideoBackend> {
        &self.adapter
    }

    /// `true` if the backend may be selected at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the backend.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Last known health.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Current in-flight count.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// `true` if another task would fit under the cap right now.
    pub fn has_capacity(&self) -> bool {
        self.active() < self.max_concurrent
    }

    /// `true` if the selector may consider this slot.
    pub fn is_eligible(&self) -> bool {
        self.is_enabled() && self.is_healthy() && self.has_capacity()
    }

    /// Most recent probe result, if any.
    pub fn last_health(&self) -> Option<HealthRecord> {
        self.last_health.lock().clone()
    }

    /// Set the health flag.
    ///
    /// Returns the previous value so callers can log transitions.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let previous = self.healthy.swap(healthy, Ordering::SeqCst);
        metrics::set_backend_healthy(&self.name, healthy);
        previous
    }

    /// Store a probe result and update the health flag from it.
    ///
    /// Returns the previous health value.
    pub fn record_health(&self, report: &HealthReport) -> bool {
        *self.last_health.lock() = Some(HealthRecord {
            detail: report.detail.clone(),
            checked_at: Utc::now(),
        });
        self.set_healthy(report.healthy)
    }

    /// Reserve one quota slot.
    ///
    /// # Returns
    /// - `Some(guard)`: the count was incremented; it is decremented when
    ///   the guard drops
    /// - `None`: the backend is at its cap
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn try_reserve(&self) -> Option<QuotaGuard<'_>> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_concurrent {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    metrics::set_active_tasks(&self.name, current + 1);
                    tracing::debug!(backend = %self.name, active = current + 1, "quota reserved");
                    return Some(QuotaGuard { slot: self });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        let now = previous.saturating_sub(1);
        metrics::set_active_tasks(&self.name, now);
        tracing::debug!(backend = %self.name, active = now, "quota released");
    }
}

impl fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSlot")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.is_enabled())
            .field("healthy", &self.is_healthy())
            .field("active", &self.active())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

/// RAII reservation of one quota slot; releases on drop.
#[must_use = "dropping the guard releases the reservation immediately"]
pub struct QuotaGuard<'a> {
    slot: &'a BackendSlot,
}

impl QuotaGuard<'_> {
    /// The reserved slot.
    pub fn slot(&self) -> &BackendSlot {
        self.slot
    }
}

impl Drop for QuotaGuard<'_> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Arena of registered backends, in registration order.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    slots: Vec<BackendSlot>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. New registrations start healthy.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for an empty or duplicate
    /// name, or a zero concurrency cap.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: Priority,
        enabled: bool,
        max_concurrent: usize,
        adapter: Arc<dyn VideoBackend>,
    ) -> Result<BackendId, DispatchError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DispatchError::Configuration(
                "backend name must not be empty".to_string(),
            ));
        }
        if self.find(&name).is_some() {
            return Err(DispatchError::Configuration(format!(
                "backend '{name}' registered twice"
            )));
        }
        if max_concurrent == 0 {
            return Err(DispatchError::Configuration(format!(
                "backend '{name}' needs max_concurrent >= 1"
            )));
        }

        metrics::set_backend_healthy(&name, true);
        metrics::set_active_tasks(&name, 0);
        tracing::info!(backend = %name, %priority, enabled, max_concurrent, "backend registered");

        self.slots.push(BackendSlot {
            name,
            priority,
            max_concurrent,
            enabled: AtomicBool::new(enabled),
            healthy: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            last_health: Mutex::new(None),
            adapter,
        });
        Ok(self.slots.len() - 1)
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by id.
    pub fn get(&self, id: BackendId) -> Option<&BackendSlot> {
        self.slots.get(id)
    }

    /// Id of the slot named `name`.
    pub fn find(&self, name: &str) -> Option<BackendId> {
        self.slots.iter().position(|s| s.name == name)
    }

    /// Slot named `name`.
    pub fn by_name(&self, name: &str) -> Option<&BackendSlot> {
        self.find(name).and_then(|id| self.get(id))
    }

    /// Slots with their ids, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (BackendId, &BackendSlot)> {
        self.slots.iter().enumerate()
    }
}
