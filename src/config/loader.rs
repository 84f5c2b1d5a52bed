//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`VideoConfig`], and run
//! validation before returning. This is the primary entry point for loading
//! dispatcher configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::VideoConfig;

/// Load a [`VideoConfig`] from a TOML file.
///
/// # Arguments
///
/// * `path`: Path to the TOML configuration file.
///
/// # Returns
///
/// - `Ok(VideoConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_video_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("backends.toml"))?;
/// println!("{} backends configured", config.backends.len());
/// ```
pub fn load_from_file(path: &Path) -> Result<VideoConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`VideoConfig`] from a TOML string.
///
/// # Arguments
///
/// * `content`: TOML content as a string.
/// * `source_name`: Identifier for the source (used in error messages).
///
/// # Returns
///
/// - `Ok(VideoConfig)` if the TOML is well-formed and valid.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<VideoConfig, ConfigError> {
    let config: VideoConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[dispatcher]
fallback_enabled = true
health_interval_s = 60

[[backends]]
name = "svd"
kind = "svd"
priority = "primary"
base_url = "http://localhost:8000"

[[backends]]
name = "pika"
kind = "pika"
priority = "secondary"
api_key = "pk-test"
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test.toml").expect("test: valid config");
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn test_load_from_str_malformed_toml_returns_parse_error() {
        let result = load_from_str("[[backends]\nname = ", "broken.toml");
        match result {
            Err(ConfigError::Parse { file, .. }) => assert_eq!(file, "broken.toml"),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_invalid_values_return_validation_error() {
        let toml_str = r#"
[dispatcher]
health_interval_s = 0

[[backends]]
name = "svd"
kind = "svd"
priority = "primary"
max_concurrent = 0
"#;
        match load_from_str(toml_str, "bad.toml") {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("dispatcher.health_interval_s"));
                assert!(msg.contains("backends[0].max_concurrent"));
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_reads_temp_file() {
        let mut file = tempfile::NamedTempFile::new().expect("test: temp file");
        file.write_all(VALID_TOML.as_bytes())
            .expect("test: write temp file");
        let config = load_from_file(file.path()).expect("test: load from file");
        assert_eq!(config.backends[0].name, "svd");
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/definitely/not/here/backends.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
