// Crash-safe persistence of all AppStates as one YAML snapshot.
use crate::core::app_state::AppState;
use crate::core::logger::Logger;
use crate::core::types::{LifecycleState, PersistenceError, TransitionRecord};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const STATE_FILE: &str = "state.yml";
const TEMP_FILE: &str = ".state.yml.tmp";
const LOCK_FILE: &str = "state.yml.lock";
/// History records kept on disk per app; in-memory history is longer.
const PERSISTED_HISTORY: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    saved_at: DateTime<Utc>,
    version: String,
    states: BTreeMap<String, PersistedApp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedApp {
    current_state: LifecycleState,
    state_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    startup_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    history: Vec<TransitionRecord>,
}

/// Single-writer store for the supervisor's app map. Writes are atomic
/// (temp file, fsync, rename); corrupt snapshots are moved aside instead of
/// taking the daemon down.
pub struct StatePersistence {
    state_dir: PathBuf,
    logger: Arc<Logger>,
}

impl StatePersistence {
    /// Fails only when the state directory cannot be created; that is a
    /// fatal initialization error for the daemon.
    pub fn new(state_dir: &Path, logger: Arc<Logger>) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(state_dir).map_err(|source| PersistenceError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            logger,
        })
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    /// Serialize every app (history truncated to the most recent
    /// `PERSISTED_HISTORY` records) and atomically replace the snapshot.
    pub fn save(
        &self,
        apps: &HashMap<String, AppState>,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let snapshot = PersistedSnapshot {
            saved_at: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
            states: apps
                .iter()
                .map(|(host, app)| {
                    let skip = app.history().len().saturating_sub(PERSISTED_HISTORY);
                    (
                        host.clone(),
                        PersistedApp {
                            current_state: app.current_state(),
                            state_changed_at: app.state_changed_at(),
                            startup_started_at: app.startup_started_at(),
                            history: app.history().iter().skip(skip).cloned().collect(),
                        },
                    )
                })
                .collect(),
        };
        let yaml = serde_yaml::to_string(&snapshot)?;

        let temp_path = self.state_dir.join(TEMP_FILE);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };

        let mut temp = File::create(&temp_path).map_err(io_err(&temp_path))?;
        temp.write_all(yaml.as_bytes()).map_err(io_err(&temp_path))?;
        temp.sync_all().map_err(io_err(&temp_path))?;
        drop(temp);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o644))
                .map_err(io_err(&temp_path))?;
        }

        // Advisory lock around the rename window; released on drop.
        let lock_path = self.state_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        lock.lock_exclusive().map_err(io_err(&lock_path))?;

        let state_path = self.state_file();
        std::fs::rename(&temp_path, &state_path).map_err(io_err(&state_path))?;
        Ok(())
    }

    /// Rebuild the app map from disk. A missing file yields an empty map; a
    /// corrupt one is renamed to `state.yml.backup.<epoch>` and also yields
    /// an empty map, so the daemon always starts.
    pub fn load(&self, now: DateTime<Utc>) -> HashMap<String, AppState> {
        let path = self.state_file();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                self.logger
                    .warn("persistence", &format!("cannot read {}: {e}", path.display()));
                return HashMap::new();
            }
        };

        let snapshot: PersistedSnapshot = match serde_yaml::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.logger.warn(
                    "persistence",
                    &format!("corrupt state file {}: {e}", path.display()),
                );
                self.quarantine(&path, now);
                return HashMap::new();
            }
        };

        self.logger.info(
            "persistence",
            &format!(
                "restoring {} apps from snapshot saved at {}",
                snapshot.states.len(),
                snapshot.saved_at.to_rfc3339()
            ),
        );

        snapshot
            .states
            .into_iter()
            .map(|(host, persisted)| {
                let app = AppState::restore(
                    host.clone(),
                    persisted.current_state,
                    persisted.state_changed_at,
                    persisted.startup_started_at,
                    persisted.history,
                    now,
                );
                (host, app)
            })
            .collect()
    }

    fn quarantine(&self, path: &Path, now: DateTime<Utc>) {
        let backup = self
            .state_dir
            .join(format!("{STATE_FILE}.backup.{}", now.timestamp()));
        match std::fs::rename(path, &backup) {
            Ok(()) => self.logger.warn(
                "persistence",
                &format!("moved corrupt state to {}", backup.display()),
            ),
            Err(e) => self
                .logger
                .warn("persistence", &format!("cannot quarantine state file: {e}")),
        }
    }

    /// Drop the oldest quarantined snapshots beyond `keep`. Returns how many
    /// were deleted.
    pub fn cleanup_backups(&self, keep: usize) -> usize {
        let prefix = format!("{STATE_FILE}.backup.");
        let mut backups: Vec<PathBuf> = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with(&prefix))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) => {
                self.logger
                    .warn("persistence", &format!("cannot list backups: {e}"));
                return 0;
            }
        };

        // Epoch suffix sorts lexicographically per-length; sort numerically.
        backups.sort_by_key(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|epoch| epoch.parse::<i64>().ok())
                .unwrap_or(0)
        });

        let excess = backups.len().saturating_sub(keep);
        let mut deleted = 0;
        for path in backups.into_iter().take(excess) {
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => self.logger.warn(
                    "persistence",
                    &format!("cannot delete backup {}: {e}", path.display()),
                ),
            }
        }
        deleted
    }
}
