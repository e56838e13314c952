// sprout-core/src/manager.rs
//! Registry lookup → resolve → fetch/verify → install → supervise, with per-name locking.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sprout_common::config::Config;
use sprout_common::error::{Result, SproutError};
use sprout_common::formulary::{validate_name, Formulary};
use sprout_common::keg::{InstalledRecord, KegRegistry};
use sprout_common::model::{Architecture, ArtifactDescriptor, Formula};
use sprout_net::{fetch_and_verify, FetchControl, Fetcher, StagedArtifact};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::install::{install_formula, remove_installed_files};
use crate::lock::NameLocks;
use crate::resolve::resolve;
use crate::supervisor::{ServiceState, ServiceStatus, Supervisor};

const FETCH_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const FORMULA_TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Installed(InstalledRecord),
    AlreadyInstalled(InstalledRecord),
}

impl InstallOutcome {
    pub fn record(&self) -> &InstalledRecord {
        match self {
            Self::Installed(r) | Self::AlreadyInstalled(r) => r,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    Upgraded {
        from: String,
        record: InstalledRecord,
    },
    UpToDate(InstalledRecord),
    /// The formula was not installed, so upgrading it installed it.
    Installed(InstalledRecord),
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub record: InstalledRecord,
    pub service: Option<ServiceStatus>,
}

#[derive(Debug, Clone)]
pub struct FormulaInfo {
    pub formula: Arc<Formula>,
    pub installed: Option<InstalledRecord>,
    pub service: Option<ServiceStatus>,
}

/// Drives every user-facing operation. Generic over the transport so tests can use
/// local files.
pub struct PackageManager<F: Fetcher> {
    config: Config,
    formulary: Formulary,
    fetcher: F,
    kegs: KegRegistry,
    supervisor: Supervisor,
    locks: NameLocks,
    arch: Architecture,
    cancel: CancellationToken,
}

impl<F: Fetcher> PackageManager<F> {
    pub fn new(config: Config, formulary: Formulary, fetcher: F) -> Result<Self> {
        let arch = Architecture::current()?;
        Ok(Self::with_architecture(config, formulary, fetcher, arch))
    }

    pub fn with_architecture(
        config: Config,
        formulary: Formulary,
        fetcher: F,
        arch: Architecture,
    ) -> Self {
        Self {
            kegs: KegRegistry::new(&config),
            supervisor: Supervisor::new(&config),
            locks: NameLocks::new(config.state_dir().join("locks")),
            cancel: CancellationToken::new(),
            config,
            formulary,
            fetcher,
            arch,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn formulary(&self) -> &Formulary {
        &self.formulary
    }

    pub fn set_formulary(&mut self, formulary: Formulary) {
        self.formulary = formulary;
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Cancelling this aborts in-flight fetches and installs; partial work is cleaned up.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers every installed service with the supervisor and reconnects to the live ones.
    /// With `relaunch`, keep-alive services that died while nothing supervised them are
    /// started again.
    pub async fn reattach(&self, relaunch: bool) -> Result<Vec<(String, ServiceStatus)>> {
        let mut out = Vec::new();
        for record in self.kegs.list_installed()? {
            let Some(spec) = record.service.clone() else {
                continue;
            };
            let binary = service_binary(&record);
            match self
                .supervisor
                .reattach(&record.name, spec, &binary, relaunch)
                .await
            {
                Ok(status) => out.push((record.name.clone(), status)),
                Err(e) => {
                    error!("[PIPELINE:{}] Could not reattach service: {}", record.name, e);
                    out.push((record.name.clone(), self.supervisor.status(&record.name).await));
                }
            }
        }
        Ok(out)
    }

    /// The requested formula plus its runtime dependency chain, dependencies first.
    fn install_order(&self, name: &str) -> Result<Vec<Arc<Formula>>> {
        let mut chain: Vec<Arc<Formula>> = Vec::new();
        let mut next = Some(self.formulary.lookup(name)?);
        while let Some(formula) = next {
            if chain.iter().any(|f| f.name == formula.name) {
                return Err(SproutError::InvalidFormula {
                    name: name.to_string(),
                    reason: "runtime dependency cycle".to_string(),
                });
            }
            next = match &formula.runtime_dependency {
                Some(dep) => Some(self.formulary.lookup(dep)?),
                None => None,
            };
            chain.push(formula);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Installs `name`, installing a missing runtime dependency first. Already-installed
    /// formulas are left alone. Returns one outcome per formula, the requested one last.
    #[instrument(skip(self))]
    pub async fn install(&self, name: &str) -> Result<Vec<InstallOutcome>> {
        validate_name(name)?;
        let mut outcomes = Vec::new();
        for formula in self.install_order(name)? {
            let _guard = self.locks.acquire(formula.name()).await?;
            if let Some(existing) = self.kegs.get_installed(formula.name())? {
                debug!(
                    "[PIPELINE:{}] Already installed at {}",
                    formula.name(),
                    existing.version
                );
                outcomes.push(InstallOutcome::AlreadyInstalled(existing));
                continue;
            }
            let record = self.install_locked(&formula).await?;
            outcomes.push(InstallOutcome::Installed(record));
        }
        Ok(outcomes)
    }

    /// Full pipeline for one formula whose lock is held and which is not installed.
    async fn install_locked(&self, formula: &Arc<Formula>) -> Result<InstalledRecord> {
        let name = formula.name();
        info!("[PIPELINE:{}] Installing version {}", name, formula.version());
        let descriptor = resolve(formula, self.arch)?;
        let staged = self.fetch_with_retry(name, &descriptor).await?;
        let record = self.run_installer(formula, staged).await?;
        self.kegs.save(&record)?;

        if let Some(spec) = &record.service {
            self.supervisor
                .register(name, spec.clone(), &service_binary(&record))
                .await?;
            self.supervisor.start(name).await?;
        }
        Ok(record)
    }

    /// Calls [`fetch_and_verify`], retrying transport failures with jittered exponential
    /// backoff. Verification failures are returned immediately.
    async fn fetch_with_retry(
        &self,
        name: &str,
        descriptor: &ArtifactDescriptor,
    ) -> Result<StagedArtifact> {
        let staging = self.config.tmp_dir();
        let retries = self.config.fetch_retries;
        let mut delay = FETCH_RETRY_BASE_DELAY;
        let mut rng = SmallRng::from_os_rng();

        for attempt in 0..=retries {
            let control = FetchControl {
                timeout: self.config.fetch_timeout,
                cancel: self.cancel.child_token(),
            };
            match fetch_and_verify(name, descriptor, &staging, &self.fetcher, &control).await {
                Ok(staged) => return Ok(staged),
                Err(e) if e.is_retryable() && attempt < retries => {
                    warn!(
                        "[PIPELINE:{}] Fetch attempt {}/{} failed: {}",
                        name,
                        attempt + 1,
                        retries + 1,
                        e
                    );
                }
                Err(e) => return Err(e),
            }

            let jitter = rng.random_range(0..=(FETCH_RETRY_BASE_DELAY.as_millis() as u64 / 2));
            tokio::select! {
                _ = tokio::time::sleep(delay + Duration::from_millis(jitter)) => {}
                _ = self.cancel.cancelled() => {
                    return Err(SproutError::Cancelled { name: name.to_string(), stage: "fetch" });
                }
            }
            delay *= 2;
        }
        Err(SproutError::Generic(format!(
            "fetch retry loop for '{name}' ended without a result"
        )))
    }

    /// Runs the blocking installer off the async runtime. On timeout or cancellation the
    /// installer is told to stop and awaited, so its rollback completes before returning.
    async fn run_installer(
        &self,
        formula: &Arc<Formula>,
        staged: StagedArtifact,
    ) -> Result<InstalledRecord> {
        let token = self.cancel.child_token();
        let formula = Arc::clone(formula);
        let config = self.config.clone();
        let installer_token = token.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let result = install_formula(
                &formula,
                staged.path(),
                staged.is_verified(),
                &config,
                &installer_token,
            );
            drop(staged);
            result
        });

        let joined = match tokio::time::timeout(self.config.fetch_timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "Install step exceeded {:?}, cancelling",
                    self.config.fetch_timeout
                );
                token.cancel();
                handle.await
            }
        };
        joined.map_err(|e| SproutError::Generic(format!("installer task failed: {e}")))?
    }

    /// Moves `name` to the registry version. The new artifact is fetched and verified before
    /// the service is touched; the service ends in the state it was in before.
    #[instrument(skip(self))]
    pub async fn upgrade(&self, name: &str) -> Result<UpgradeOutcome> {
        validate_name(name)?;
        let order = self.install_order(name)?;
        let Some((formula, deps)) = order.split_last() else {
            return Err(SproutError::NotFound(format!("No formula named '{name}'")));
        };
        for dep in deps {
            let _guard = self.locks.acquire(dep.name()).await?;
            if self.kegs.get_installed(dep.name())?.is_none() {
                self.install_locked(dep).await?;
            }
        }

        let _guard = self.locks.acquire(name).await?;
        let Some(old) = self.kegs.get_installed(name)? else {
            info!("[PIPELINE:{}] Not installed; installing instead", name);
            return Ok(UpgradeOutcome::Installed(self.install_locked(formula).await?));
        };
        if old.version == formula.version {
            debug!("[PIPELINE:{}] Already at {}", name, old.version);
            return Ok(UpgradeOutcome::UpToDate(old));
        }

        match (
            semver::Version::parse(&old.version),
            semver::Version::parse(formula.version()),
        ) {
            (Ok(installed), Ok(available)) if available < installed => warn!(
                "[PIPELINE:{}] Registry version {} is older than installed {}; downgrading",
                name, available, installed
            ),
            _ => info!(
                "[PIPELINE:{}] Upgrading {} -> {}",
                name,
                old.version,
                formula.version()
            ),
        }
        let descriptor = resolve(formula, self.arch)?;
        let staged = self.fetch_with_retry(name, &descriptor).await?;

        let was_registered = self.supervisor.status(name).await.state != ServiceState::Unregistered;
        let was_running = self.supervisor.stop_for_upgrade(name).await?;

        let finished = self
            .finish_upgrade(formula, staged, &old, was_running, was_registered)
            .await;
        match finished {
            Ok(record) => Ok(UpgradeOutcome::Upgraded {
                from: old.version,
                record,
            }),
            Err(e) => {
                error!("[PIPELINE:{}] Upgrade failed: {}", name, e);
                if was_running {
                    if let Err(restart_err) = self.supervisor.start(name).await {
                        error!(
                            "[PIPELINE:{}] Could not restart the service: {}",
                            name, restart_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Everything an upgrade does once the service is stopped. The record is saved as soon
    /// as the new files are live, so it never names a version that is not on disk.
    async fn finish_upgrade(
        &self,
        formula: &Arc<Formula>,
        staged: StagedArtifact,
        old: &InstalledRecord,
        was_running: bool,
        was_registered: bool,
    ) -> Result<InstalledRecord> {
        let name = formula.name();
        let record = self.run_installer(formula, staged).await?;
        self.kegs.save(&record)?;

        let stale: Vec<PathBuf> = old
            .binary_paths
            .iter()
            .filter(|p| !record.binary_paths.contains(p))
            .cloned()
            .collect();
        if let Err(e) = remove_installed_files(name, &stale) {
            warn!(
                "[PIPELINE:{}] Left files from {} in place: {}",
                name, old.version, e
            );
        }

        match &record.service {
            Some(spec) => {
                self.supervisor
                    .register(name, spec.clone(), &service_binary(&record))
                    .await?;
                // A service new in this version starts like it would on install.
                if was_running || !was_registered {
                    self.supervisor.start(name).await?;
                }
            }
            None => self.supervisor.deregister(name).await?,
        }
        Ok(record)
    }

    /// Stops and deregisters the service, removes installed files, then the install record.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, name: &str) -> Result<InstalledRecord> {
        validate_name(name)?;
        let _guard = self.locks.acquire(name).await?;
        let record = self
            .kegs
            .get_installed(name)?
            .ok_or_else(|| SproutError::NotFound(format!("Formula '{name}' is not installed")))?;

        for other in self.kegs.list_installed()? {
            let depends = self
                .formulary
                .lookup(&other.name)
                .ok()
                .and_then(|f| f.runtime_dependency.clone());
            if depends.as_deref() == Some(name) {
                warn!(
                    "[PIPELINE:{}] '{}' depends on it and stays installed",
                    name, other.name
                );
            }
        }

        self.supervisor.deregister(name).await?;
        remove_installed_files(name, &record.binary_paths)?;
        self.kegs.remove(name)?;
        info!("[PIPELINE:{}] Uninstalled version {}", name, record.version);
        Ok(record)
    }

    /// Makes sure an installed service is known to the supervisor.
    async fn ensure_registered(&self, name: &str) -> Result<()> {
        if self.supervisor.status(name).await.state != ServiceState::Unregistered {
            return Ok(());
        }
        let record = self
            .kegs
            .get_installed(name)?
            .ok_or_else(|| SproutError::NotFound(format!("Formula '{name}' is not installed")))?;
        let spec = record.service.clone().ok_or_else(|| {
            SproutError::NotFound(format!("Formula '{name}' does not define a service"))
        })?;
        self.supervisor
            .register(name, spec, &service_binary(&record))
            .await
    }

    pub async fn service_start(&self, name: &str) -> Result<ServiceStatus> {
        validate_name(name)?;
        let _guard = self.locks.acquire(name).await?;
        self.ensure_registered(name).await?;
        self.supervisor.start(name).await?;
        Ok(self.supervisor.status(name).await)
    }

    pub async fn service_stop(&self, name: &str) -> Result<ServiceStatus> {
        validate_name(name)?;
        let _guard = self.locks.acquire(name).await?;
        self.ensure_registered(name).await?;
        self.supervisor.stop(name).await?;
        Ok(self.supervisor.status(name).await)
    }

    pub async fn service_restart(&self, name: &str) -> Result<ServiceStatus> {
        validate_name(name)?;
        let _guard = self.locks.acquire(name).await?;
        self.ensure_registered(name).await?;
        self.supervisor.restart(name).await?;
        Ok(self.supervisor.status(name).await)
    }

    /// Read-only. A name with no registered service is `NotFound`.
    pub async fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        let status = self.supervisor.status(name).await;
        if status.state == ServiceState::Unregistered {
            return Err(SproutError::NotFound(format!(
                "No service registered for '{name}'"
            )));
        }
        Ok(status)
    }

    pub async fn list(&self) -> Result<Vec<ListEntry>> {
        let mut entries = Vec::new();
        for record in self.kegs.list_installed()? {
            let service = if record.service.is_some() {
                Some(self.supervisor.status(&record.name).await)
            } else {
                None
            };
            entries.push(ListEntry { record, service });
        }
        Ok(entries)
    }

    pub async fn info(&self, name: &str) -> Result<FormulaInfo> {
        let formula = self.formulary.lookup(name)?;
        let installed = self.kegs.get_installed(name)?;
        let service = match &installed {
            Some(r) if r.service.is_some() => Some(self.supervisor.status(name).await),
            _ => None,
        };
        Ok(FormulaInfo {
            formula,
            installed,
            service,
        })
    }

    /// Runs the installed binary with the formula's test arguments and checks that the
    /// output mentions the expected string (the version unless overridden).
    #[instrument(skip(self))]
    pub async fn test(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        let record = self
            .kegs
            .get_installed(name)?
            .ok_or_else(|| SproutError::NotFound(format!("Formula '{name}' is not installed")))?;
        let formula = self.formulary.lookup(name)?;
        let test = formula.test.clone().unwrap_or_default();
        let expect = test.expect.clone().unwrap_or_else(|| record.version.clone());
        let binary = service_binary(&record);

        debug!("[TEST:{}] Running {} {:?}", name, binary.display(), test.args);
        let output = tokio::time::timeout(
            FORMULA_TEST_TIMEOUT,
            Command::new(&binary)
                .args(&test.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            SproutError::ValidationError(format!(
                "test for '{name}' timed out after {FORMULA_TEST_TIMEOUT:?}"
            ))
        })??;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(SproutError::ValidationError(format!(
                "test for '{name}' exited with {}: {}",
                output.status,
                combined.trim()
            )));
        }
        if !combined.contains(&expect) {
            return Err(SproutError::ValidationError(format!(
                "test for '{name}' expected output containing '{expect}', got '{}'",
                combined.trim()
            )));
        }
        Ok(combined)
    }

    /// Reattaches every service, relaunching the ones that should be up, and supervises them
    /// until cancelled. Services keep running afterwards.
    pub async fn supervise(&self) -> Result<Vec<(String, ServiceStatus)>> {
        let statuses = self.reattach(true).await?;
        info!("Supervising {} service(s)", statuses.len());
        self.cancel.cancelled().await;
        info!("Supervision interrupted; leaving services running");
        self.supervisor.detach_all().await;
        Ok(statuses)
    }
}

fn service_binary(record: &InstalledRecord) -> PathBuf {
    record
        .service_binary()
        .map(PathBuf::from)
        .or_else(|| {
            record
                .service
                .as_ref()
                .and_then(|s| s.program())
                .map(PathBuf::from)
        })
        .unwrap_or_default()
}
