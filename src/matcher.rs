//! # Capability matcher: pure compatibility checks and parameter adaptation
//!
//! ## Responsibility
//! Decide whether a [`GenerationTask`] can run on a backend with the given
//! [`BackendCapabilities`], and if so compute the adapted parameters
//! (resolution, frame rate, duration) to submit.
//!
//! ## Guarantees
//! - Pure: no I/O, no clocks, no shared state
//! - Deterministic: the same inputs always give the same [`Adaptation`]
//! - Duration is never a reason to reject; it is clamped
//!
//! ## NOT Responsible For
//! - Health or quota filtering (see: `selector`)
//! - Mutating tasks (the dispatcher applies the adaptation)

use crate::capabilities::BackendCapabilities;
use crate::task::GenerationTask;
use thiserror::Error;

/// Why a task cannot run on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Incompatibility {
    /// The task has a reference image but the backend is text-only.
    #[error("backend does not support image-to-video")]
    ImageInputUnsupported,

    /// The task is text-only but the backend needs a reference image.
    #[error("backend does not support text-to-video")]
    TextInputUnsupported,

    /// Neither the requested resolution nor any of its equivalents is
    /// supported.
    #[error("resolution {requested} not supported (and no equivalent is)")]
    Resolution {
        /// The resolution the task asked for.
        requested: String,
    },

    /// The backend declares no frame rates at all.
    #[error("backend declares no frame rates")]
    NoFrameRates,
}

/// Parameters a task must be adapted to before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adaptation {
    /// Resolution to submit; equals the requested one when supported.
    pub resolution: String,
    /// Frame rate to submit; the supported rate nearest the request.
    pub fps: u32,
    /// Duration to submit; the request clamped to the backend maximum.
    pub duration: u32,
}

impl Adaptation {
    /// `true` if any parameter differs from what `task` asked for.
    pub fn changes(&self, task: &GenerationTask) -> bool {
        self.resolution != task.resolution || self.fps != task.fps || self.duration != task.duration
    }

    /// Write the adapted parameters into `task`.
    pub fn apply(&self, task: &mut GenerationTask) {
        task.resolution = self.resolution.clone();
        task.fps = self.fps;
        task.duration = self.duration;
    }
}

/// Known equivalent resolutions, most preferred first (the key itself
/// leads every list).
const RESOLUTION_EQUIVALENTS: &[(&str, &[&str])] = &[
    ("1920x1080", &["1920x1080", "1280x720", "1024x576"]),
    ("1280x720", &["1280x720", "1024x576", "1920x1080"]),
    ("720x1280", &["720x1280", "576x1024"]),
    ("1024x1024", &["1024x1024", "768x768"]),
];

/// Parse `WIDTHxHEIGHT` into its two dimensions.
///
/// # Returns
/// - `Some((w, h))` for well-formed strings with positive dimensions
/// - `None` otherwise
///
/// # Panics
///
/// This function never panics.
pub fn parse_resolution(resolution: &str) -> Option<(u32, u32)> {
    let (w, h) = resolution.trim().split_once(['x', 'X'])?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

/// Pick the resolution to submit for `requested`.
///
/// Exact support wins. Otherwise the equivalence table for `requested` is
/// walked in order and the first supported entry is used.
///
/// # Returns
/// - `Some(resolution)` when the request or an equivalent is supported
/// - `None` when nothing matches
pub fn adapt_resolution(requested: &str, caps: &BackendCapabilities) -> Option<String> {
    if caps.supports_resolution(requested) {
        return Some(requested.to_string());
    }
    RESOLUTION_EQUIVALENTS
        .iter()
        .find(|(key, _)| *key == requested)
        .and_then(|(_, alts)| alts.iter().find(|alt| caps.supports_resolution(alt)))
        .map(|alt| (*alt).to_string())
}

/// Nearest supported frame rate to `requested`; ties go to the lower rate.
///
/// Returns `None` only when `supported` is empty.
pub fn nearest_fps(requested: u32, supported: &[u32]) -> Option<u32> {
    supported
        .iter()
        .copied()
        .min_by_key(|&fps| (fps.abs_diff(requested), fps))
}

/// Clamp `requested` into `1..=max`. A backend declaring `0` is treated
/// as 1s.
pub fn clamp_duration(requested: u32, max: u32) -> u32 {
    requested.clamp(1, max.max(1))
}

/// Check `task` against `caps` and compute the adaptation.
///
/// # Arguments
/// * `task`: The task as the caller submitted it.
/// * `caps`: The candidate backend's declared capabilities.
///
/// # Returns
/// - `Ok(Adaptation)`: the task can run with these parameters
/// - `Err(Incompatibility)`: the first reason it cannot
///
/// # Panics
///
/// This function never panics.
pub fn check(task: &GenerationTask, caps: &BackendCapabilities) -> Result<Adaptation, Incompatibility> {
    if task.requires_image_input() {
        if !caps.supports_image_to_video {
            return Err(Incompatibility::ImageInputUnsupported);
        }
    } else if !caps.supports_text_to_video {
        return Err(Incompatibility::TextInputUnsupported);
    }

    let resolution =
        adapt_resolution(&task.resolution, caps).ok_or_else(|| Incompatibility::Resolution {
            requested: task.resolution.clone(),
        })?;

    let fps = nearest_fps(task.fps, &caps.supported_fps).ok_or(Incompatibility::NoFrameRates)?;

    Ok(Adaptation {
        resolution,
        fps,
        duration: clamp_duration(task.duration, caps.max_duration_seconds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(resolutions: &[&str], fps: &[u32], max_duration: u32, i2v: bool) -> BackendCapabilities {
        BackendCapabilities {
            name: "test".into(),
            supports_text_to_video: true,
            supports_image_to_video: i2v,
            supports_video_to_video: false,
            max_duration_seconds: max_duration,
            supported_resolutions: resolutions.iter().map(|r| r.to_string()).collect(),
            supported_fps: fps.to_vec(),
            cost_per_second: 0.0,
            requires_gpu: false,
            is_local: false,
        }
    }

    #[test]
    fn test_parse_resolution_accepts_well_formed() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution(" 576X1024 "), Some((576, 1024)));
    }

    #[test]
    fn test_parse_resolution_rejects_garbage() {
        assert_eq!(parse_resolution("1280"), None);
        assert_eq!(parse_resolution("0x720"), None);
        assert_eq!(parse_resolution("axb"), None);
    }

    #[test]
    fn test_exact_resolution_is_kept() {
        let c = caps(&["1280x720", "1920x1080"], &[24], 10, false);
        assert_eq!(adapt_resolution("1920x1080", &c).as_deref(), Some("1920x1080"));
    }

    #[test]
    fn test_hd_request_falls_back_to_equivalent() {
        let c = caps(&["1024x576", "576x1024"], &[24], 4, false);
        assert_eq!(adapt_resolution("1280x720", &c).as_deref(), Some("1024x576"));
        assert_eq!(adapt_resolution("1920x1080", &c).as_deref(), Some("1024x576"));
    }

    #[test]
    fn test_equivalents_follow_table_order() {
        let c = caps(&["1920x1080", "1024x576"], &[24], 4, false);
        // 1280x720 prefers 1024x576 over 1920x1080.
        assert_eq!(adapt_resolution("1280x720", &c).as_deref(), Some("1024x576"));
    }

    #[test]
    fn test_portrait_request_maps_to_portrait_equivalent() {
        let c = caps(&["1024x576", "576x1024"], &[24], 4, false);
        assert_eq!(adapt_resolution("720x1280", &c).as_deref(), Some("576x1024"));
    }

    #[test]
    fn test_unknown_resolution_without_support_is_none() {
        let c = caps(&["1280x720"], &[24], 4, false);
        assert_eq!(adapt_resolution("640x480", &c), None);
        assert_eq!(adapt_resolution("1024x1024", &c), None);
    }

    #[test]
    fn test_nearest_fps_exact() {
        assert_eq!(nearest_fps(30, &[24, 30]), Some(30));
    }

    #[test]
    fn test_nearest_fps_tie_prefers_lower() {
        assert_eq!(nearest_fps(27, &[24, 30]), Some(24));
    }

    #[test]
    fn test_nearest_fps_picks_closest() {
        assert_eq!(nearest_fps(60, &[24, 30]), Some(30));
        assert_eq!(nearest_fps(1, &[30, 24]), Some(24));
    }

    #[test]
    fn test_nearest_fps_empty_is_none() {
        assert_eq!(nearest_fps(24, &[]), None);
    }

    #[test]
    fn test_check_clamps_duration_instead_of_rejecting() {
        let c = caps(&["1024x576"], &[24], 4, false);
        let task = GenerationTask::new("t", "p").with_duration(10).with_resolution("1024x576");
        let a = check(&task, &c).expect("test: compatible");
        assert_eq!(a.duration, 4);
        assert!(a.changes(&task));
    }

    #[test]
    fn test_clamp_duration_bounds() {
        assert_eq!(clamp_duration(0, 4), 1);
        assert_eq!(clamp_duration(3, 4), 3);
        assert_eq!(clamp_duration(10, 4), 4);
        assert_eq!(clamp_duration(10, 0), 1);
    }

    #[test]
    fn test_check_rejects_image_on_text_only_backend() {
        let c = caps(&["1280x720"], &[24], 10, false);
        let task = GenerationTask::new("t", "p").with_input_image("ref.png");
        assert_eq!(check(&task, &c), Err(Incompatibility::ImageInputUnsupported));
    }

    #[test]
    fn test_check_rejects_text_on_image_only_backend() {
        let mut c = caps(&["1280x720"], &[24], 10, true);
        c.supports_text_to_video = false;
        let task = GenerationTask::new("t", "p");
        assert_eq!(check(&task, &c), Err(Incompatibility::TextInputUnsupported));
    }

    #[test]
    fn test_check_rejects_unsupported_resolution() {
        let c = caps(&["1280x720"], &[24], 10, false);
        let task = GenerationTask::new("t", "p").with_resolution("640x480");
        assert!(matches!(check(&task, &c), Err(Incompatibility::Resolution { .. })));
    }

    #[test]
    fn test_check_is_deterministic() {
        let c = caps(&["1024x576", "576x1024"], &[24, 30], 4, true);
        let task = GenerationTask::new("t", "p").with_fps(27).with_duration(9);
        assert_eq!(check(&task, &c), check(&task, &c));
    }

    #[test]
    fn test_apply_writes_parameters() {
        let c = caps(&["1024x576"], &[30], 3, false);
        let mut task = GenerationTask::new("t", "p").with_duration(10);
        let a = check(&task, &c).expect("test: compatible");
        a.apply(&mut task);
        assert_eq!(task.resolution, "1024x576");
        assert_eq!(task.fps, 30);
        assert_eq!(task.duration, 3);
        assert!(!a.changes(&task));
    }
}
