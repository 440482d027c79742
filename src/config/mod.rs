//! Configuration for the buffer proxy.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/bufferproxy/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

mod logging;

#[cfg(test)]
mod tests;

pub use logging::{FileLogging, LogFormat, LogRotation, LoggingConfig};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration for the buffer proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy's catch-all HTTP(S) surface binds to.
    pub proxy_bind: SocketAddr,

    /// Address the dashboard HTTP/WS surface binds to. If equal to
    /// `proxy_bind`, both surfaces share a single listener.
    pub dashboard_bind: SocketAddr,

    /// Upstream Anthropic API base URL.
    pub upstream_api_url: String,

    /// Fraction of the model's context window at which a checkpoint is
    /// started in the background (spec.md §6, `CHECKPOINT_THRESHOLD`).
    pub checkpoint_threshold: f64,

    /// Fraction of the context window at which a ready checkpoint is
    /// swapped in (spec.md §6, `SWAP_THRESHOLD`).
    pub swap_threshold: f64,

    /// Disable the buffering engine entirely; every request is forwarded
    /// untouched (spec.md §6, `PASSTHROUGH`).
    pub passthrough: bool,

    /// Idle conversations are evicted from memory after this many seconds.
    pub conversation_ttl_seconds: u64,

    /// Minimum observed input tokens before a checkpoint is worth running
    /// at all (spec.md §6, `COMPACT_TRIGGER_TOKENS`).
    pub compact_trigger_tokens: u64,

    /// Path to the SQLite database backing conversation persistence.
    pub persistence_db_path: PathBuf,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_bind: "127.0.0.1:8080".parse().unwrap(),
            dashboard_bind: "127.0.0.1:8081".parse().unwrap(),
            upstream_api_url: "https://api.anthropic.com".to_string(),
            checkpoint_threshold: 0.70,
            swap_threshold: 0.80,
            passthrough: false,
            conversation_ttl_seconds: 7200,
            compact_trigger_tokens: 50_000,
            persistence_db_path: PathBuf::from("./data/buffer-proxy.db"),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of `Config` that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub buffer: Option<FileBuffer>,
    pub persistence: Option<FilePersistence>,
    pub logging: Option<FileLogging>,
}

/// `[buffer]` section of the config file.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileBuffer {
    pub proxy_bind: Option<String>,
    pub dashboard_bind: Option<String>,
    pub upstream_api_url: Option<String>,
    pub checkpoint_threshold: Option<f64>,
    pub swap_threshold: Option<f64>,
    pub passthrough: Option<bool>,
    pub conversation_ttl_seconds: Option<u64>,
    pub compact_trigger_tokens: Option<u64>,
}

/// `[persistence]` section of the config file.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FilePersistence {
    pub db_path: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/bufferproxy/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("bufferproxy").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist. Called during
    /// startup to help users discover configuration options.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        if path.exists() {
            return;
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // config is optional
            }
        }

        let template = Self::default().to_toml();
        let _ = std::fs::write(&path, template);
    }

    /// Render the default config as a documented TOML template.
    pub fn to_toml(&self) -> String {
        format!(
            "# bufferproxy configuration\n\
             # Every value here can be overridden by an environment variable;\n\
             # see README for the full list.\n\
             \n\
             [buffer]\n\
             proxy_bind = \"{proxy_bind}\"\n\
             dashboard_bind = \"{dashboard_bind}\"\n\
             upstream_api_url = \"{upstream_api_url}\"\n\
             checkpoint_threshold = {checkpoint_threshold}\n\
             swap_threshold = {swap_threshold}\n\
             passthrough = {passthrough}\n\
             conversation_ttl_seconds = {ttl}\n\
             compact_trigger_tokens = {compact_trigger_tokens}\n\
             \n\
             [persistence]\n\
             db_path = \"{db_path}\"\n\
             \n\
             [logging]\n\
             level = \"{log_level}\"\n\
             format = \"{log_format}\"\n\
             file_enabled = {log_file_enabled}\n\
             file_dir = \"{log_dir}\"\n\
             file_rotation = \"{log_rotation}\"\n",
            proxy_bind = self.proxy_bind,
            dashboard_bind = self.dashboard_bind,
            upstream_api_url = self.upstream_api_url,
            checkpoint_threshold = self.checkpoint_threshold,
            swap_threshold = self.swap_threshold,
            passthrough = self.passthrough,
            ttl = self.conversation_ttl_seconds,
            compact_trigger_tokens = self.compact_trigger_tokens,
            db_path = self.persistence_db_path.display(),
            log_level = self.logging.level,
            log_format = self.logging.format.as_str(),
            log_file_enabled = self.logging.file_enabled,
            log_dir = self.logging.file_dir.display(),
            log_rotation = self.logging.file_rotation.as_str(),
        )
    }

    /// Load file config if it exists.
    ///
    /// # Panics / exits
    /// If the config file exists but cannot be parsed. This is intentional:
    /// a broken config should fail fast with a clear error, not silently
    /// fall back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!(
                        "\n╔══════════════════════════════════════════════════════════════╗"
                    );
                    eprintln!(
                        "║  CONFIG ERROR - Failed to parse configuration file          ║"
                    );
                    eprintln!(
                        "╚══════════════════════════════════════════════════════════════╝\n"
                    );
                    eprintln!("  File: {}\n", path.display());
                    eprintln!("  Error: {}\n", e);
                    eprintln!("  Tip: Check for:\n");
                    eprintln!("    - Missing quotes around string values");
                    eprintln!("    - Invalid boolean values (use true/false)");
                    eprintln!("    - Typos in section names\n");
                    eprintln!("  To reset, delete the file and restart bufferproxy.\n");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
                eprintln!("║  CONFIG ERROR - Cannot read configuration file              ║");
                eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
                eprintln!("  File: {}\n", path.display());
                eprintln!("  Error: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > defaults.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let buffer = file.buffer.unwrap_or_default();
        let persistence = file.persistence.unwrap_or_default();
        let defaults = Self::default();

        let proxy_bind = std::env::var("PROXY_BIND")
            .ok()
            .or(buffer.proxy_bind)
            .unwrap_or_else(|| defaults.proxy_bind.to_string())
            .parse()
            .expect("Invalid PROXY_BIND address");

        let dashboard_bind = std::env::var("DASHBOARD_BIND")
            .ok()
            .or(buffer.dashboard_bind)
            .unwrap_or_else(|| defaults.dashboard_bind.to_string())
            .parse()
            .expect("Invalid DASHBOARD_BIND address");

        let upstream_api_url = std::env::var("UPSTREAM_API_URL")
            .ok()
            .or(buffer.upstream_api_url)
            .unwrap_or(defaults.upstream_api_url);

        let checkpoint_threshold = std::env::var("CHECKPOINT_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(buffer.checkpoint_threshold)
            .unwrap_or(defaults.checkpoint_threshold);

        let swap_threshold = std::env::var("SWAP_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(buffer.swap_threshold)
            .unwrap_or(defaults.swap_threshold);

        let passthrough = std::env::var("PASSTHROUGH")
            .ok()
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .or(buffer.passthrough)
            .unwrap_or(defaults.passthrough);

        let conversation_ttl_seconds = std::env::var("CONVERSATION_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(buffer.conversation_ttl_seconds)
            .unwrap_or(defaults.conversation_ttl_seconds);

        let compact_trigger_tokens = std::env::var("COMPACT_TRIGGER_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(buffer.compact_trigger_tokens)
            .unwrap_or(defaults.compact_trigger_tokens);

        let persistence_db_path = std::env::var("PERSISTENCE_DB_PATH")
            .ok()
            .or(persistence.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.persistence_db_path);

        let logging = LoggingConfig::from_file_and_env(file.logging);

        Self {
            proxy_bind,
            dashboard_bind,
            upstream_api_url,
            checkpoint_threshold,
            swap_threshold,
            passthrough,
            conversation_ttl_seconds,
            compact_trigger_tokens,
            persistence_db_path,
            logging,
        }
    }
}
