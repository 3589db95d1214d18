//! Configuration file parser for `<data dir>/config.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
//!
//! Components never look settings up on their own: the binary loads a
//! [`Config`] once and passes paths and limits to each constructor.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Application name, used for the data directory and the temp fallback.
pub const APP_NAME: &str = "feedkeep";

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const OPML_FILE_NAME: &str = "feeds.opml";
pub const ITEM_STORAGE_FILE_NAME: &str = "feed-items.json";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the OPML feed document. Defaults to `<data dir>/feeds.opml`.
    pub opml_file: Option<PathBuf>,

    /// Path of the item storage file. Defaults to `<data dir>/feed-items.json`.
    pub storage_file: Option<PathBuf>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Maximum accepted feed body size in bytes.
    pub max_feed_bytes: usize,

    /// User-Agent header sent with every fetch.
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            opml_file: None,
            storage_file: None,
            request_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "opml_file",
        "storage_file",
        "request_timeout_secs",
        "max_feed_bytes",
        "user_agent",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// The feed document path, defaulting to `data_dir/feeds.opml`.
    pub fn opml_path(&self, data_dir: &Path) -> PathBuf {
        self.opml_file
            .clone()
            .unwrap_or_else(|| data_dir.join(OPML_FILE_NAME))
    }

    /// The item storage path, defaulting to `data_dir/feed-items.json`.
    pub fn storage_path(&self, data_dir: &Path) -> PathBuf {
        self.storage_file
            .clone()
            .unwrap_or_else(|| data_dir.join(ITEM_STORAGE_FILE_NAME))
    }
}

// ============================================================================
// Data Directory
// ============================================================================

/// Resolves and creates the application data directory.
///
/// `%LOCALAPPDATA%\feedkeep` (or `%APPDATA%`) on Windows, `$HOME/.feedkeep`
/// elsewhere. Falls back to `<tmp>/feedkeep` when the preferred location is
/// unknown or cannot be created due to permissions.
pub fn resolve_data_dir() -> Result<PathBuf, ConfigError> {
    match preferred_data_dir() {
        Some(dir) => ensure_dir_or_fallback(dir),
        None => {
            tracing::warn!("No home or app data directory in environment, using temp directory");
            ensure_dir_or_fallback(temp_data_dir())
        }
    }
}

fn preferred_data_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("LOCALAPPDATA")
            .or_else(|| std::env::var_os("APPDATA"))
            .map(|base| PathBuf::from(base).join(APP_NAME))
    } else {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(format!(".{}", APP_NAME)))
    }
}

fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(APP_NAME)
}

fn ensure_dir_or_fallback(dir: PathBuf) -> Result<PathBuf, ConfigError> {
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let fallback = temp_data_dir();
            tracing::warn!(
                path = %dir.display(),
                fallback = %fallback.display(),
                error = %e,
                "Failed to create data directory, using temp directory"
            );
            std::fs::create_dir_all(&fallback)?;
            Ok(fallback)
        }
        Err(e) => Err(ConfigError::Io(e)),
    }
}

// ============================================================================
// Tests
// ============================================================================
