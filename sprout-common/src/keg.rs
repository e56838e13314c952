// sprout-common/src/keg.rs
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use super::config::Config;
use super::error::{Result, SproutError};
use super::model::ServiceSpec;

/// The durable result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    pub binary_paths: Vec<PathBuf>,
    /// False when the artifact had no checksum to verify against.
    pub verified: bool,
    /// Service registration, already placeholder-expanded.
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledRecord {
    /// The binary a service runs: the path matching the command's program, or the first one.
    pub fn service_binary(&self) -> Option<&Path> {
        let program = self.service.as_ref().and_then(|s| s.program());
        program
            .and_then(|p| self.binary_paths.iter().find(|b| b.as_path() == Path::new(p)))
            .or_else(|| self.binary_paths.first())
            .map(PathBuf::as_path)
    }
}

/// Reads and writes one JSON record per installed formula under the state directory.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    dir: PathBuf,
}

impl KegRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.installed_state_dir(),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn get_installed(&self, name: &str) -> Result<Option<InstalledRecord>> {
        let path = self.record_path(name);
        debug!(
            "[KEG_REGISTRY:{}] Reading install record at {}",
            name,
            path.display()
        );
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!(
                    "[KEG_REGISTRY:{}] Failed to read {}: {}",
                    name,
                    path.display(),
                    e
                );
                Err(e.into())
            }
        }
    }

    pub fn save(&self, record: &InstalledRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        atomic_write_file(&self.record_path(&record.name), &content)?;
        debug!(
            "[KEG_REGISTRY:{}] Saved install record for version {}",
            record.name, record.version
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledRecord>> {
        let mut records = Vec::new();
        if !self.dir.is_dir() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    warn!("[KEG_REGISTRY] Error reading state entry: {}. Skipping.", e);
                    continue;
                }
            };
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(SproutError::from)
                .and_then(|raw| serde_json::from_str::<InstalledRecord>(&raw).map_err(SproutError::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "[KEG_REGISTRY] Ignoring unreadable record {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// Writes `content` to a temp file next to `path`, syncs it, then renames it into place.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        SproutError::Generic(format!("Cannot get parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| {
        error!(
            "Failed to persist temporary file over {}: {}",
            path.display(),
            e.error
        );
        SproutError::Io(Arc::new(e.error))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn record(name: &str) -> InstalledRecord {
        InstalledRecord {
            name: name.to_string(),
            version: "0.5.1".to_string(),
            binary_paths: vec![PathBuf::from(format!("/opt/sprout/bin/{name}"))],
            verified: false,
            service: None,
            installed_at: Utc::now(),
        }
    }

    #[test]
    fn records_survive_a_new_registry_instance() {
        let root = TempDir::new().unwrap();
        let config = Config::with_prefix(root.path());
        KegRegistry::new(&config).save(&record("zeta")).unwrap();
        KegRegistry::new(&config).save(&record("alpha")).unwrap();

        let reopened = KegRegistry::new(&config);
        let zeta = reopened.get_installed("zeta").unwrap().unwrap();
        assert_eq!(zeta.version, "0.5.1");
        assert!(!zeta.verified);
        let names: Vec<_> = reopened
            .list_installed()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        reopened.remove("zeta").unwrap();
        reopened.remove("zeta").unwrap();
        assert_eq!(reopened.get_installed("zeta").unwrap(), None);
    }

    #[test]
    fn service_binary_prefers_the_command_program() {
        let mut rec = record("svc");
        rec.binary_paths = vec![PathBuf::from("/p/bin/helper"), PathBuf::from("/p/bin/svc")];
        rec.service = Some(ServiceSpec {
            command: vec!["/p/bin/svc".into()],
            keep_alive: true,
            environment: Default::default(),
            stdout_log_path: None,
            stderr_log_path: None,
            working_dir: None,
        });
        assert_eq!(rec.service_binary(), Some(Path::new("/p/bin/svc")));
    }
}
