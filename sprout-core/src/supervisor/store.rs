// sprout-core/src/supervisor/store.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sprout_common::error::Result;
use sprout_common::keg::atomic_write_file;
use sprout_common::model::ServiceSpec;
use tracing::{debug, warn};

/// What survives a sprout process exiting: enough to adopt or relaunch the service later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedService {
    pub name: String,
    pub spec: ServiceSpec,
    pub binary_path: PathBuf,
    /// The user's intent, independent of whether the process is alive right now.
    pub desired_running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restarts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceStore {
    dir: PathBuf,
}

impl ServiceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn load(&self, name: &str) -> Result<Option<PersistedService>> {
        match fs::read_to_string(self.path(name)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, entry: &PersistedService) -> Result<()> {
        let content = serde_json::to_vec_pretty(entry)?;
        atomic_write_file(&self.path(&entry.name), &content)?;
        debug!(
            "[SUPERVISOR:{}] Persisted state (desired_running={}, pid={:?})",
            entry.name, entry.desired_running, entry.pid
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Vec<PersistedService> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<PersistedService> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| {
                let parsed = fs::read_to_string(&p)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<PersistedService>(&raw).ok());
                if parsed.is_none() {
                    warn!("[SUPERVISOR] Ignoring unreadable state file {}", p.display());
                }
                parsed
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
