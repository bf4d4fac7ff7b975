//! Durable storage backed by a JSON snapshot file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::snapshot::Snapshot;
use super::{StorageProvider, Stores};
use crate::error::Result;

/// File-backed provider.
///
/// On open, a previous snapshot is loaded if it is readable and carries the
/// current schema version; anything else starts from empty state. Every
/// `persist` rewrites the whole file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    stores: Stores,
    /// Serializes snapshot writes from concurrent tenants
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open (or create) a snapshot at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let stores = match load_snapshot(&path) {
            Some(snapshot) => {
                info!(
                    path = %path.display(),
                    policies = snapshot.policies.len(),
                    buckets = snapshot.bucket_states.len(),
                    windows = snapshot.window_states.len(),
                    "Loaded state snapshot"
                );
                snapshot.into_stores()
            }
            None => Stores::new(),
        };

        Ok(Self {
            path,
            stores,
            write_lock: Mutex::new(()),
        })
    }
}

fn load_snapshot(path: &Path) -> Option<Snapshot> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No state snapshot, starting empty");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable state snapshot, starting empty");
            return None;
        }
    };

    let snapshot: Snapshot = match serde_json::from_slice(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid state snapshot, starting empty");
            return None;
        }
    };

    if !snapshot.is_current_version() {
        warn!(
            path = %path.display(),
            version = %snapshot.schema_version,
            "State snapshot has unsupported schema version, starting empty"
        );
        return None;
    }

    Some(snapshot)
}

impl StorageProvider for FileStorage {
    fn stores(&self) -> &Stores {
        &self.stores
    }

    fn persist(&self) -> Result<()> {
        let _write = self.write_lock.lock();

        let data = serde_json::to_vec_pretty(&Snapshot::capture(&self.stores))?;
        let temp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;

        debug!(path = %self.path.display(), bytes = data.len(), "State persisted");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
