// Daemon configuration file.
//
// Loaded from `~/.vellum/config.toml` by default, or from an explicit path.
// Every field has a default so a missing or partial file still yields a
// runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root directory for Vellum global state: `~/.vellum/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vellum"))
}

/// Path to the global config file: `~/.vellum/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Daemon configuration at `~/.vellum/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub docs: DocsConfig,
    pub sync: SyncTuning,
}

impl DaemonConfig {
    /// Load from `~/.vellum/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Socket address string the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Network settings for the sync server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 7413 }
    }
}

/// Location and filtering of the Markdown tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DocsConfig {
    /// Root directory of the document tree.
    pub root: PathBuf,
    /// Paths (relative to the root) excluded from the tree.
    pub ignore: Vec<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("./docs"), ignore: Vec::new() }
    }
}

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncTuning {
    /// Debounce window for coalescing disk writes, in milliseconds.
    pub flush_debounce_ms: u64,
    /// Per-frame write timeout so one stuck client cannot pin a task.
    pub write_timeout_ms: u64,
    /// Outbound frames buffered per connection before senders block.
    pub outbound_queue_len: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self { flush_debounce_ms: 100, write_timeout_ms: 10_000, outbound_queue_len: 64 }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
