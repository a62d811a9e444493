//! # Persistence
//!
//! Saving and restoring the applied-batch history for session continuity
//! across process restarts.
//!
//! The on-disk format is a JSON-serialized ordered list of
//! [`PatchBatch`](crate::batch::PatchBatch) records; restoring replays them
//! through the engine. Saving runs on a background thread and is
//! fire-and-forget with respect to the apply pass: write failures are logged
//! and swallowed, never surfaced. The only errors returned to callers are
//! path precondition violations.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::PatchBatch;

/// Precondition violations on the persistence entry points.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The path cannot hold a history file.
    #[error("invalid history path: {0}")]
    InvalidPath(PathBuf),
}

/// Why a background save did not complete. Logged, never returned.
#[derive(Debug, Error)]
enum SaveError {
    /// Writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serializing the history failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fails fast on paths that cannot hold a history file.
pub(crate) fn validate_path(path: &Path) -> Result<(), PersistError> {
    if path.as_os_str().is_empty() || path.parent().is_none() {
        return Err(PersistError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

/// Serializes `history` to `path` on a background thread.
///
/// Failures are logged and swallowed. The returned handle may be joined by
/// callers that need the write to have finished, or dropped to fire and
/// forget.
pub(crate) fn save_in_background(path: PathBuf, history: Vec<PatchBatch>) -> JoinHandle<()> {
    info!(
        "saving {} applied patch batches to {}",
        history.len(),
        path.display()
    );
    thread::spawn(move || {
        if let Err(err) = write_history(&path, &history) {
            warn!("failed to save patch history to {}: {}", path.display(), err);
        }
    })
}

/// Writes the history list as JSON, creating parent directories as needed.
fn write_history(path: &Path, history: &[PatchBatch]) -> Result<(), SaveError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let json = serde_json::to_string(history)?;
    fs::write(path, json)?;
    Ok(())
}

/// Reads the history list back from disk.
///
/// A missing file is an empty history; unreadable or unparsable files are
/// logged and also yield an empty history.
pub(crate) fn load_history(path: &Path) -> Vec<PatchBatch> {
    if !path.exists() {
        return Vec::new();
    }
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("could not read patch history at {}: {}", path.display(), err);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<PatchBatch>>(&text) {
        Ok(batches) => {
            info!("loaded {} patch batches from {}", batches.len(), path.display());
            batches
        }
        Err(err) => {
            warn!(
                "could not parse patch history at {}: {}",
                path.display(),
                err
            );
            Vec::new()
        }
    }
}
