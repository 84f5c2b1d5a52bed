//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`VideoConfig`] that cannot
//! be expressed through the type system alone (range checks, unique names,
//! cross-field invariants between poll interval and maximum wait).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - Checking that credentials actually work (adapters report that through
//!   their health check)

use super::VideoConfig;
use std::collections::HashSet;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Field path (e.g., "backends[1].max_concurrent").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Validate all semantic constraints on a [`VideoConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Arguments
///
/// * `config`: The parsed config to validate.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &VideoConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Dispatcher ───────────────────────────────────────────────────
    if config.dispatcher.health_interval_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "dispatcher.health_interval_s".into(),
            value: "0".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    if config.dispatcher.health_check_timeout_s == 0 {
        errors.push(ConfigError::InvalidField {
            field: "dispatcher.health_check_timeout_s".into(),
            value: "0".into(),
            reason: "must be at least 1 second".into(),
        });
    }

    if config.dispatcher.max_concurrent_requests == 0 {
        errors.push(ConfigError::InvalidField {
            field: "dispatcher.max_concurrent_requests".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.dispatcher.finished_task_capacity == 0 {
        errors.push(ConfigError::InvalidField {
            field: "dispatcher.finished_task_capacity".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Backends ─────────────────────────────────────────────────────
    if config.backends.is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "backends".into(),
            value: "[]".into(),
            reason: "at least one backend must be configured".into(),
        });
    }

    let mut seen = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let path = |field: &str| format!("backends[{i}].{field}");

        if backend.name.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: path("name"),
                value: String::new(),
                reason: "backend name must not be empty".into(),
            });
        } else if !seen.insert(backend.name.as_str()) {
            errors.push(ConfigError::InvalidField {
                field: path("name"),
                value: backend.name.clone(),
                reason: "backend names must be unique".into(),
            });
        }

        if backend.max_concurrent == 0 {
            errors.push(ConfigError::InvalidField {
                field: path("max_concurrent"),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        if let Some(url) = &backend.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ConfigError::InvalidField {
                    field: path("base_url"),
                    value: url.clone(),
                    reason: "must start with http:// or https://".into(),
                });
            }
        }

        if backend.poll_interval_s == Some(0) {
            errors.push(ConfigError::InvalidField {
                field: path("poll_interval_s"),
                value: "0".into(),
                reason: "must be at least 1 second".into(),
            });
        }

        if let (Some(interval), Some(max_wait)) = (backend.poll_interval_s, backend.max_wait_s) {
            if interval > max_wait {
                errors.push(ConfigError::InvalidField {
                    field: path("poll_interval_s"),
                    value: interval.to_string(),
                    reason: format!("must be \u{2264} max_wait_s ({max_wait})"),
                });
            }
        }

        if backend.request_timeout_s == Some(0) {
            errors.push(ConfigError::InvalidField {
                field: path("request_timeout_s"),
                value: "0".into(),
                reason: "must be at least 1 second".into(),
            });
        }
    }

    // ── Metrics port range ──────────────────────────────────────────
    if config.observability.metrics_port == Some(0) {
        errors.push(ConfigError::InvalidField {
            field: "observability.metrics_port".into(),
            value: "0".into(),
            reason: "metrics port must be at least 1".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
