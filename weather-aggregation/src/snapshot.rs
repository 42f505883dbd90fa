//! Crash-consistent JSON snapshots.
//!
//! A snapshot lives in a primary file with a companion backup path that
//! doubles as the staging area for writes:
//!
//! 1. serialize and write the whole snapshot to the backup path
//! 2. fsync the backup file
//! 3. rename backup over primary (atomic on POSIX)
//!
//! A crash before the rename leaves the previous primary intact; a crash
//! after it leaves the new one. Loading tries the primary first and falls
//! back to the backup, which covers a crash between steps 2 and 3 on a
//! first save.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {path} is not valid json: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SnapshotError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A primary/backup file pair holding one JSON document.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    primary: PathBuf,
    backup: PathBuf,
}

impl SnapshotFile {
    /// `<dir>/<name>.json` with backup `<dir>/<name>_backup.json`.
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            primary: dir.join(format!("{name}.json")),
            backup: dir.join(format!("{name}_backup.json")),
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn backup(&self) -> &Path {
        &self.backup
    }

    /// Writes `value` through the backup path and renames it into place.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_vec_pretty(value)?;
        if let Some(dir) = self.primary.parent() {
            fs::create_dir_all(dir).map_err(|e| SnapshotError::io(dir, e))?;
        }

        {
            let mut staged = File::create(&self.backup).map_err(|e| SnapshotError::io(&self.backup, e))?;
            staged
                .write_all(&encoded)
                .map_err(|e| SnapshotError::io(&self.backup, e))?;
            staged
                .sync_all()
                .map_err(|e| SnapshotError::io(&self.backup, e))?;
        }

        fs::rename(&self.backup, &self.primary).map_err(|e| SnapshotError::io(&self.primary, e))?;
        Ok(())
    }

    /// Reads the snapshot, preferring the primary file.
    ///
    /// Returns `Ok(None)` when neither file exists. An unreadable or corrupt
    /// primary falls back to the backup; the error is only returned when the
    /// backup cannot be used either.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SnapshotError> {
        match read_json(&self.primary) {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, backup = %self.backup.display(), "primary snapshot unusable, trying backup");
                return match read_json(&self.backup) {
                    Ok(Some(value)) => Ok(Some(value)),
                    Ok(None) => Err(err),
                    Err(backup_err) => Err(backup_err),
                };
            }
        }
        read_json(&self.backup)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SnapshotError::io(path, err)),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })
}
