//! Logging configuration: level, output format, and file rotation.

use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Log Rotation
// ─────────────────────────────────────────────────────────────────────────────

/// Log file rotation strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogRotation {
    /// Rotate log files hourly (spec.md §6).
    #[default]
    Hourly,
    /// Rotate log files daily.
    Daily,
    /// Never rotate - single log file.
    Never,
}

impl LogRotation {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "daily" => Self::Daily,
            "never" => Self::Never,
            _ => Self::Hourly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Never => "never",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log Format
// ─────────────────────────────────────────────────────────────────────────────

/// Output format for the stdout/stderr log sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogFormat {
    /// Human-readable, for interactive use.
    #[default]
    Pretty,
    /// Line-delimited JSON, for ingestion by log collectors.
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,
    /// Output format for the stdout sink.
    pub format: LogFormat,
    /// Enable file logging in addition to stdout.
    pub file_enabled: bool,
    /// Directory for log files.
    pub file_dir: PathBuf,
    /// Log file rotation strategy.
    pub file_rotation: LogRotation,
    /// Prefix for log file names (e.g. "bufferproxy" -> "bufferproxy.2024-01-15-14.log").
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_enabled: false,
            file_dir: PathBuf::from("./logs"),
            file_rotation: LogRotation::Hourly,
            file_prefix: "bufferproxy".to_string(),
        }
    }
}

/// Logging settings as loaded from the `[logging]` config-file table.
#[derive(Debug, Deserialize, Default)]
pub struct FileLogging {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
    pub file_rotation: Option<String>,
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    /// Merge `[logging]` file config, then apply env var overrides.
    pub fn from_file_and_env(file: Option<FileLogging>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let level = std::env::var("LOG_LEVEL").ok().or(file.level).unwrap_or(defaults.level);
        let format = std::env::var("LOG_FORMAT")
            .ok()
            .or(file.format)
            .map(|s| LogFormat::from_str(&s))
            .unwrap_or(defaults.format);
        let file_enabled = std::env::var("LOG_FILE_ENABLED")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .or(file.file_enabled)
            .unwrap_or(defaults.file_enabled);
        let file_dir = std::env::var("LOG_DIR")
            .ok()
            .or(file.file_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.file_dir);
        let file_rotation = file
            .file_rotation
            .map(|s| LogRotation::from_str(&s))
            .unwrap_or(defaults.file_rotation);
        let file_prefix = file.file_prefix.unwrap_or(defaults.file_prefix);

        Self {
            level,
            format,
            file_enabled,
            file_dir,
            file_rotation,
            file_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_roundtrips() {
        assert_eq!(LogRotation::from_str("daily"), LogRotation::Daily);
        assert_eq!(LogRotation::from_str("bogus"), LogRotation::Hourly);
    }

    #[test]
    fn format_roundtrips() {
        assert_eq!(LogFormat::from_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("whatever"), LogFormat::Pretty);
    }
}
