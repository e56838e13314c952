// sprout-core/src/install/mod.rs
pub mod extract;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sprout_common::config::Config;
use sprout_common::error::{Result, SproutError};
use sprout_common::keg::InstalledRecord;
use sprout_common::model::Formula;
use tempfile::Builder as TempBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;
use walkdir::WalkDir;

pub use extract::{extract_archive, source_root, ArchiveKind};

/// Unpacks a staged archive and promotes its install targets into the prefix.
///
/// The live prefix is only touched after every target has been copied next to its
/// destination. A failure at any point before or during promotion restores whatever
/// was live before.
pub fn install_formula(
    formula: &Formula,
    archive: &Path,
    verified: bool,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<InstalledRecord> {
    let name = formula.name();
    if !verified && config.strict_checksums {
        return Err(SproutError::UnverifiedArtifact(name.to_string()));
    }

    fs::create_dir_all(config.tmp_dir())?;
    let workdir = TempBuilder::new()
        .prefix(&format!(".{name}-extract-"))
        .tempdir_in(config.tmp_dir())?;
    extract_archive(archive, workdir.path())
        .map_err(|e| SproutError::install_failed(name, format!("extraction failed: {e}")))?;
    check_cancelled(name, cancel)?;

    let root = source_root(workdir.path())?;
    let mut txn = InstallTransaction::new(name);
    for target in &formula.install_targets {
        check_cancelled(name, cancel)?;
        let source = locate_source(&root, &target.source).ok_or_else(|| {
            SproutError::install_failed(
                name,
                format!("'{}' not found in {}", target.source, archive.display()),
            )
        })?;
        let dest_dir = config.resolve_path(&target.destination);
        txn.stage(&source, &dest_dir)?;
    }
    check_cancelled(name, cancel)?;

    let binary_paths = txn.commit()?;
    debug!(
        "[INSTALL:{}] Promoted {} file(s) for version {}",
        name,
        binary_paths.len(),
        formula.version()
    );

    Ok(InstalledRecord {
        name: name.to_string(),
        version: formula.version().to_string(),
        binary_paths,
        verified,
        service: formula.service.as_ref().map(|s| s.expanded(config)),
        installed_at: Utc::now(),
    })
}

fn check_cancelled(name: &str, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SproutError::Cancelled {
            name: name.to_string(),
            stage: "install",
        });
    }
    Ok(())
}

/// Finds `source` under `root`: the exact relative path first, then any file with the
/// same name anywhere in the tree (shallowest, then lexicographically first).
pub fn locate_source(root: &Path, source: &str) -> Option<PathBuf> {
    let direct = root.join(source);
    if direct.is_file() {
        return Some(direct);
    }
    let wanted = Path::new(source).file_name()?;
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == wanted)
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

#[derive(Debug)]
struct StagedFile {
    staged: PathBuf,
    live: PathBuf,
    backup: Option<PathBuf>,
    committed: bool,
}

/// A set of files copied beside their destinations, promoted together or not at all.
///
/// Dropping an unfinished transaction rolls it back.
#[derive(Debug)]
pub struct InstallTransaction {
    name: String,
    entries: Vec<StagedFile>,
    finished: bool,
}

impl InstallTransaction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
            finished: false,
        }
    }

    fn sibling(dir: &Path, file_name: &str, tag: &str) -> PathBuf {
        dir.join(format!(".{file_name}.sprout-{tag}-{}", Uuid::new_v4().simple()))
    }

    /// Copies `source` into `dest_dir` under a hidden temporary name. Returns the live path
    /// it will occupy once committed.
    pub fn stage(&mut self, source: &Path, dest_dir: &Path) -> Result<PathBuf> {
        let fail = |reason: String| {
            error!("[INSTALL:{}] {}", self.name, reason);
            SproutError::install_failed(&self.name, reason)
        };
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| fail(format!("invalid source path {}", source.display())))?;

        fs::create_dir_all(dest_dir).map_err(|e| {
            fail(format!(
                "cannot create destination {}: {}",
                dest_dir.display(),
                e
            ))
        })?;
        let live = dest_dir.join(&file_name);
        if self.entries.iter().any(|e| e.live == live) {
            return Err(fail(format!("two install targets map to {}", live.display())));
        }
        if live.is_dir() {
            return Err(fail(format!("{} exists and is a directory", live.display())));
        }

        let staged = Self::sibling(dest_dir, &file_name, "new");
        fs::copy(source, &staged).map_err(|e| {
            let _ = fs::remove_file(&staged);
            fail(format!("cannot write {}: {}", staged.display(), e))
        })?;
        debug!(
            "[INSTALL:{}] Staged {} -> {}",
            self.name,
            source.display(),
            staged.display()
        );
        self.entries.push(StagedFile {
            staged,
            live: live.clone(),
            backup: None,
            committed: false,
        });
        Ok(live)
    }

    /// Moves the live file at entry `index` aside and renames the staged copy into place.
    pub(crate) fn commit_entry(&mut self, index: usize) -> Result<()> {
        let name = self.name.clone();
        let entry = &mut self.entries[index];
        let fail = |reason: String| SproutError::install_failed(&name, reason);

        if entry.live.symlink_metadata().is_ok() {
            let dir = entry.live.parent().unwrap_or(Path::new("."));
            let file_name = entry
                .live
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let backup = Self::sibling(dir, &file_name, "old");
            fs::rename(&entry.live, &backup).map_err(|e| {
                fail(format!("cannot move aside {}: {}", entry.live.display(), e))
            })?;
            entry.backup = Some(backup);
        }
        fs::rename(&entry.staged, &entry.live)
            .map_err(|e| fail(format!("cannot promote {}: {}", entry.live.display(), e)))?;
        entry.committed = true;
        Ok(())
    }

    /// Promotes every staged file, rolling back all of them if any rename fails.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        for index in 0..self.entries.len() {
            if let Err(e) = self.commit_entry(index) {
                error!("[INSTALL:{}] Commit failed, rolling back: {}", self.name, e);
                self.rollback();
                return Err(e);
            }
        }
        for entry in &self.entries {
            if let Some(backup) = &entry.backup {
                if let Err(e) = fs::remove_file(backup) {
                    warn!(
                        "[INSTALL:{}] Could not remove backup {}: {}",
                        self.name,
                        backup.display(),
                        e
                    );
                }
            }
        }
        self.finished = true;
        Ok(self.entries.iter().map(|e| e.live.clone()).collect())
    }

    /// Restores the pre-transaction state: removes staged and promoted files, puts backups back.
    pub fn rollback(&mut self) {
        for entry in self.entries.iter().rev() {
            if entry.committed {
                remove_quietly(&self.name, &entry.live);
            } else {
                remove_quietly(&self.name, &entry.staged);
            }
            if let Some(backup) = &entry.backup {
                if let Err(e) = fs::rename(backup, &entry.live) {
                    error!(
                        "[INSTALL:{}] Failed to restore {} from {}: {}",
                        self.name,
                        entry.live.display(),
                        backup.display(),
                        e
                    );
                }
            }
        }
        self.finished = true;
    }
}

impl Drop for InstallTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

fn remove_quietly(name: &str, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("[INSTALL:{}] Could not remove {}: {}", name, path.display(), e),
    }
}

/// Removes installed files. Missing files are not an error.
pub fn remove_installed_files(name: &str, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!("[INSTALL:{}] Removed {}", name, path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SproutError::install_failed(
                    name,
                    format!("cannot remove {}: {}", path.display(), e),
                ))
            }
        }
    }
    Ok(())
}
