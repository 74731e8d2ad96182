//! Persistence of input checkpoints across agent restarts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A saved input position, opaque to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub value: String,
    /// Unix timestamp (seconds) of the last update.
    pub updated: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    checkpoints: FxHashMap<String, Checkpoint>,
}

/// Directory-backed store of input checkpoints.
///
/// Loaded once at agent init, persisted once at shutdown; in between, reads
/// and writes are in-memory only.
pub struct CheckpointManager {
    path: PathBuf,
    entries: Mutex<FxHashMap<String, Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("checkpoints.toml"),
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Loads the snapshot left by a previous run.
    ///
    /// Errors are fatal: resuming inputs from a corrupt snapshot would
    /// silently re-read or skip data.
    pub fn init(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create checkpoint directory {}", parent.display()))?;
        }
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let snapshot: Snapshot = toml::from_str(&raw)
                    .with_context(|| format!("corrupt checkpoint snapshot at {}", self.path.display()))?;
                log::info!(
                    "loaded {} checkpoints from {}",
                    snapshot.checkpoints.len(),
                    self.path.display()
                );
                *self.entries.lock().unwrap() = snapshot.checkpoints;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("no checkpoint snapshot at {}, starting fresh", self.path.display());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read checkpoint snapshot at {}", self.path.display()));
            }
        }
        Ok(())
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let updated = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.entries.lock().unwrap().insert(
            key.into(),
            Checkpoint {
                value: value.into(),
                updated,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Checkpoint> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Persists the snapshot.
    ///
    /// Failures are logged, never propagated: at shutdown there is no caller
    /// left to retry.
    pub fn stop(&self) {
        let snapshot = Snapshot {
            checkpoints: self.entries.lock().unwrap().clone(),
        };
        match toml::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    log::error!("failed to persist checkpoints to {}: {e}", self.path.display());
                } else {
                    log::info!(
                        "persisted {} checkpoints to {}",
                        snapshot.checkpoints.len(),
                        self.path.display()
                    );
                }
            }
            Err(e) => log::error!("failed to serialize the checkpoint snapshot: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CheckpointManager;

    #[test]
    fn checkpoints_round_trip_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let store = CheckpointManager::new(dir.path());
        store.init().unwrap();
        store.put("input_file/var/log/app.log", "offset=1024");
        store.stop();

        let reloaded = CheckpointManager::new(dir.path());
        reloaded.init().unwrap();
        let cp = reloaded.get("input_file/var/log/app.log").expect("checkpoint should survive");
        assert_eq!(cp.value, "offset=1024");
    }

    #[test]
    fn a_missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointManager::new(dir.path().join("nested"));
        store.init().unwrap();
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn a_corrupt_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoints.toml"), "not [ valid toml").unwrap();
        let store = CheckpointManager::new(dir.path());
        assert!(store.init().is_err());
    }
}
