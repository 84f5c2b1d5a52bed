//! Static capability declarations for a backend.
//!
//! A [`BackendCapabilities`] value is built once when an adapter is
//! constructed and never changes afterwards.

use serde::{Deserialize, Serialize};

/// Declared limits and features of one provider.
///
/// `supported_resolutions` and `supported_fps` behave as sets; their order is
/// kept only so that listings are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Provider display name.
    pub name: String,
    /// Accepts text-only prompts.
    pub supports_text_to_video: bool,
    /// Accepts a reference image.
    pub supports_image_to_video: bool,
    /// Accepts a reference video.
    pub supports_video_to_video: bool,
    /// Longest clip the provider renders, in seconds.
    pub max_duration_seconds: u32,
    /// Accepted `WIDTHxHEIGHT` strings.
    pub supported_resolutions: Vec<String>,
    /// Accepted frame rates.
    pub supported_fps: Vec<u32>,
    /// Price per rendered second, in USD.
    pub cost_per_second: f64,
    /// Needs a local GPU.
    pub requires_gpu: bool,
    /// Runs on the local machine rather than a hosted API.
    pub is_local: bool,
}

impl BackendCapabilities {
    /// `true` if `resolution` is in the supported set.
    pub fn supports_resolution(&self, resolution: &str) -> bool {
        self.supported_resolutions.iter().any(|r| r == resolution)
    }

    /// `true` if `fps` is in the supported set.
    pub fn supports_fps(&self, fps: u32) -> bool {
        self.supported_fps.contains(&fps)
    }

    /// Estimated price (USD) of rendering `duration_s` seconds.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn estimate_cost(&self, duration_s: u32) -> f64 {
        f64::from(duration_s) * self.cost_per_second
    }
}
