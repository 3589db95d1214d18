//! File persistence shared by the registry and the JSON item store.
//!
//! Documents are always replaced wholesale: the new content goes to a
//! uniquely named temporary file next to the target, is synced, then renamed
//! over it. When the target location is not writable the document is written
//! to `<tmp>/feedkeep/<file name>` instead and the caller switches to that path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::APP_NAME;

/// Returns the modification time of `path`, or `None` if it does not exist.
pub(crate) fn modified_time(path: &Path) -> std::io::Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes `content` to `path` atomically.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // SEC-009: Randomized temp filename to prevent TOCTOU race conditions
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    let written = file.write_all(content).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    // On Windows, rename fails if destination exists
    #[cfg(windows)]
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }

    std::fs::rename(&temp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        e
    })
}

/// The temp-directory location used when `path` cannot be written.
pub(crate) fn fallback_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "document".into());
    std::env::temp_dir().join(APP_NAME).join(file_name)
}

/// Writes `content` to `path`, falling back to a temp-directory copy.
///
/// Returns the path that was actually written. Only fails when both the
/// primary and the fallback write fail.
pub(crate) fn save_with_fallback(path: &Path, content: &[u8]) -> std::io::Result<PathBuf> {
    match write_atomic(path, content) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(primary) => {
            let fallback = fallback_path(path);
            if fallback == path {
                return Err(primary);
            }
            tracing::warn!(
                path = %path.display(),
                fallback = %fallback.display(),
                error = %primary,
                "Failed to write document, saving to temp directory instead"
            );
            write_atomic(&fallback, content)?;
            Ok(fallback)
        }
    }
}
