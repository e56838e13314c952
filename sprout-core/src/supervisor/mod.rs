// sprout-core/src/supervisor/mod.rs
//! In-process service supervision.
//!
//! Each registered service is a slot guarded by its own async mutex. The mutex is held
//! only while a transition is applied; the per-service watcher task waits on the
//! process and sleeps through restart backoff without it, so `stop` can always get in
//! and cancel a pending restart.

pub mod process;
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use sprout_common::config::{Config, RestartBackoff};
use sprout_common::error::{Result, SproutError};
use sprout_common::model::ServiceSpec;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use self::process::ServiceProcess;
pub use self::store::{PersistedService, ServiceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unregistered,
    Stopped,
    Running,
    Crashed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unregistered => "unregistered",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Crashed => "crashed",
        })
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// `None` while a keep-alive service is waiting out its restart backoff.
    pub pid: Option<u32>,
    pub restarts: u32,
    pub last_exit: Option<String>,
}

impl ServiceStatus {
    fn unregistered() -> Self {
        Self {
            state: ServiceState::Unregistered,
            pid: None,
            restarts: 0,
            last_exit: None,
        }
    }
}

#[derive(Debug)]
struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct Slot {
    spec: ServiceSpec,
    binary_path: PathBuf,
    state: ServiceState,
    pid: Option<u32>,
    restarts: u32,
    last_exit: Option<String>,
    watcher: Option<Watcher>,
}

impl Slot {
    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.state,
            pid: self.pid,
            restarts: self.restarts,
            last_exit: self.last_exit.clone(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    backoff: RestartBackoff,
    grace: Duration,
    store: ServiceStore,
}

impl Shared {
    fn persist(&self, name: &str, slot: &Slot) {
        // A crash does not change what the user asked for.
        let desired_running = matches!(slot.state, ServiceState::Running | ServiceState::Crashed);
        self.persist_as(name, slot, desired_running);
    }

    fn persist_as(&self, name: &str, slot: &Slot, desired_running: bool) {
        let entry = PersistedService {
            name: name.to_string(),
            spec: slot.spec.clone(),
            binary_path: slot.binary_path.clone(),
            desired_running,
            pid: slot.pid,
            restarts: slot.restarts,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.save(&entry) {
            warn!("[SUPERVISOR:{}] Could not persist state: {}", name, e);
        }
    }

    /// Whether the stored intent no longer wants the service up. This is how a stop or an
    /// uninstall from another sprout process reaches this one's watcher.
    fn stop_requested(&self, name: &str) -> bool {
        match self.store.load(name) {
            Ok(Some(entry)) => !entry.desired_running,
            Ok(None) => true,
            Err(e) => {
                warn!("[SUPERVISOR:{}] Could not read stored intent: {}", name, e);
                false
            }
        }
    }
}

/// Owns every registered service and its watcher task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    slots: Arc<StdMutex<HashMap<String, Arc<Mutex<Slot>>>>>,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self::with_settings(
            ServiceStore::new(config.service_state_dir()),
            config.restart_backoff,
            config.stop_grace_period,
        )
    }

    pub fn with_settings(store: ServiceStore, backoff: RestartBackoff, grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                backoff,
                grace,
                store,
            }),
            slots: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn slot(&self, name: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<Mutex<Slot>>> {
        self.slot(name)
            .ok_or_else(|| SproutError::NotFound(format!("service '{name}' is not registered")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Inserts or updates a slot without persisting. Returns the slot and whether it is new.
    async fn upsert(
        &self,
        name: &str,
        spec: ServiceSpec,
        binary_path: &Path,
    ) -> (Arc<Mutex<Slot>>, bool) {
        if let Some(slot) = self.slot(name) {
            {
                let mut s = slot.lock().await;
                s.spec = spec;
                s.binary_path = binary_path.to_path_buf();
            }
            return (slot, false);
        }
        let fresh = Arc::new(Mutex::new(Slot {
            spec,
            binary_path: binary_path.to_path_buf(),
            state: ServiceState::Stopped,
            pid: None,
            restarts: 0,
            last_exit: None,
            watcher: None,
        }));
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = slots.entry(name.to_string()).or_insert(fresh).clone();
        (slot, true)
    }

    /// Registers `name`, or updates its spec and binary in place. A running process keeps
    /// running; the new spec applies from its next launch.
    #[instrument(skip(self, spec, binary_path))]
    pub async fn register(&self, name: &str, spec: ServiceSpec, binary_path: &Path) -> Result<()> {
        let (slot, created) = self.upsert(name, spec, binary_path).await;
        let s = slot.lock().await;
        if created {
            debug!("[SUPERVISOR:{}] Registered", name);
        } else {
            debug!("[SUPERVISOR:{}] Updated registration ({})", name, s.state);
        }
        self.shared.persist(name, &s);
        Ok(())
    }

    /// Stops the service if needed and forgets it, including its persisted state.
    #[instrument(skip(self))]
    pub async fn deregister(&self, name: &str) -> Result<()> {
        if let Some(slot) = self.slot(name) {
            self.stop_slot(name, &slot).await?;
            self.slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(name);
        }
        self.shared.store.remove(name)?;
        debug!("[SUPERVISOR:{}] Deregistered", name);
        Ok(())
    }

    /// Launches the service. Already running is success and spawns nothing.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<()> {
        let slot = self.require(name)?;
        let mut s = slot.lock().await;
        if s.state == ServiceState::Running {
            debug!("[SUPERVISOR:{}] Already running (pid {:?})", name, s.pid);
            return Ok(());
        }
        let child = process::launch(name, &s.spec)?;
        self.attach(name, &slot, &mut s, ServiceProcess::Owned(child), true);
        info!("[SUPERVISOR:{}] Started (pid {:?})", name, s.pid);
        Ok(())
    }

    /// Terminates the service: SIGTERM to its process group, then SIGKILL after the grace
    /// period. A pending restart backoff is cancelled. Stopping a stopped service succeeds.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot = self.require(name)?;
        self.stop_slot(name, &slot).await.map(|_| ())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Stops ahead of a binary replacement and reports whether the service had been running,
    /// so the caller can put it back the way it was.
    pub async fn stop_for_upgrade(&self, name: &str) -> Result<bool> {
        let Some(slot) = self.slot(name) else {
            return Ok(false);
        };
        let was_running = self.stop_slot(name, &slot).await?;
        debug!(
            "[SUPERVISOR:{}] Stopped for upgrade (was_running={})",
            name, was_running
        );
        Ok(was_running)
    }

    pub async fn status(&self, name: &str) -> ServiceStatus {
        match self.slot(name) {
            Some(slot) => slot.lock().await.status(),
            None => ServiceStatus::unregistered(),
        }
    }

    /// Registers a service known from a previous sprout process and reconnects to it.
    ///
    /// A recorded pid that is still alive is adopted and watched. A service that should be
    /// running but is not is relaunched when `relaunch` is set and it is keep-alive;
    /// otherwise it is reported as crashed. Only a relaunch writes to the store.
    pub async fn reattach(
        &self,
        name: &str,
        spec: ServiceSpec,
        binary_path: &Path,
        relaunch: bool,
    ) -> Result<ServiceStatus> {
        let persisted = self.shared.store.load(name).unwrap_or_else(|e| {
            warn!("[SUPERVISOR:{}] Ignoring unreadable state: {}", name, e);
            None
        });
        let (slot, _) = self.upsert(name, spec, binary_path).await;
        let mut s = slot.lock().await;
        if s.state == ServiceState::Running {
            return Ok(s.status());
        }
        let Some(persisted) = persisted.filter(|p| p.desired_running) else {
            return Ok(s.status());
        };
        s.restarts = persisted.restarts;

        if let Some(pid) = persisted.pid.filter(|pid| process::is_alive(*pid)) {
            debug!("[SUPERVISOR:{}] Adopting running pid {}", name, pid);
            self.attach(name, &slot, &mut s, ServiceProcess::Adopted(pid), false);
        } else if relaunch && s.spec.keep_alive {
            info!("[SUPERVISOR:{}] Was running before, relaunching", name);
            let child = process::launch(name, &s.spec)?;
            self.attach(name, &slot, &mut s, ServiceProcess::Owned(child), true);
        } else {
            s.state = ServiceState::Crashed;
            s.pid = None;
            s.last_exit = Some("not running since the last sprout session".to_string());
        }
        Ok(s.status())
    }

    /// Drops every watcher without touching the processes, which keep running detached.
    pub async fn detach_all(&self) {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for slot in slots {
            if let Some(watcher) = slot.lock().await.watcher.take() {
                watcher.handle.abort();
            }
        }
    }

    fn attach(
        &self,
        name: &str,
        slot: &Arc<Mutex<Slot>>,
        s: &mut Slot,
        child: ServiceProcess,
        persist: bool,
    ) {
        let cancel = CancellationToken::new();
        s.state = ServiceState::Running;
        s.pid = child.pid();
        let handle = tokio::spawn(watch(
            name.to_string(),
            Arc::clone(slot),
            Arc::clone(&self.shared),
            child,
            cancel.clone(),
        ));
        s.watcher = Some(Watcher { cancel, handle });
        if persist {
            self.shared.persist(name, s);
        }
    }

    /// Signals and transitions under the slot lock, then waits for the process outside it
    /// so the watcher can observe cancellation. Returns whether the service was running.
    async fn stop_slot(&self, name: &str, slot: &Arc<Mutex<Slot>>) -> Result<bool> {
        let (pending, pid, was_running) = {
            let mut s = slot.lock().await;
            let was_running = s.state == ServiceState::Running;
            let pid = s.pid;
            // Intent goes to the store before the signal, so a watcher in another sprout
            // process sees a requested stop rather than a crash.
            self.shared.persist_as(name, &s, false);
            if let Some(pid) = pid {
                if let Err(e) = process::signal(pid, libc::SIGTERM) {
                    // A failed signal leaves the state as it was.
                    self.shared.persist(name, &s);
                    return Err(SproutError::service_failed(name, "stop", e.to_string()));
                }
            }
            let pending = s.watcher.take();
            if let Some(watcher) = &pending {
                watcher.cancel.cancel();
                s.last_exit = Some("stopped".to_string());
            }
            s.state = ServiceState::Stopped;
            s.pid = None;
            self.shared.persist(name, &s);
            (pending, pid, was_running)
        };

        let Some(Watcher { mut handle, .. }) = pending else {
            debug!("[SUPERVISOR:{}] Stopped", name);
            return Ok(was_running);
        };
        let grace = self.shared.grace;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(
                "[SUPERVISOR:{}] Still alive after {:?}, sending SIGKILL",
                name, grace
            );
            let killed = match pid {
                Some(pid) => process::signal(pid, libc::SIGKILL)
                    .map_err(|e| format!("cannot deliver SIGKILL: {e}")),
                None => Ok(()),
            };
            let outcome = match killed {
                Ok(()) => match tokio::time::timeout(grace, &mut handle).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(format!("process {pid:?} did not exit after SIGKILL")),
                },
                Err(reason) => Err(reason),
            };
            if let Err(reason) = outcome {
                handle.abort();
                let mut s = slot.lock().await;
                // The process outlived the stop, so it is not Stopped. Intent stays off.
                if s.state == ServiceState::Stopped {
                    s.state = ServiceState::Crashed;
                    s.pid = pid;
                    s.last_exit = Some(reason.clone());
                    self.shared.persist_as(name, &s, false);
                }
                error!("[SUPERVISOR:{}] Stop failed: {}", name, reason);
                return Err(SproutError::service_failed(name, "stop", reason));
            }
        }
        debug!("[SUPERVISOR:{}] Stopped", name);
        Ok(was_running)
    }
}

/// Waits for the service to exit and applies the crash policy. Returns when the process is
/// gone for good or `cancel` fires.
async fn watch(
    name: String,
    slot: Arc<Mutex<Slot>>,
    shared: Arc<Shared>,
    mut child: ServiceProcess,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let launched_at = Instant::now();
        let exited = tokio::select! {
            exit = child.wait() => Some(exit),
            _ = cancel.cancelled() => None,
        };
        let Some(exit) = exited else {
            // stop() signalled the group; reap so the pid does not linger.
            child.wait().await;
            return;
        };

        let mut s = slot.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if shared.stop_requested(&name) {
            info!("[SUPERVISOR:{}] Stopped from another sprout process ({})", name, exit);
            s.state = ServiceState::Stopped;
            s.pid = None;
            s.last_exit = Some("stopped".to_string());
            s.watcher = None;
            return;
        }
        warn!("[SUPERVISOR:{}] Process {:?} {}", name, s.pid, exit);
        s.pid = None;
        s.last_exit = Some(exit);

        if !s.spec.keep_alive {
            s.state = ServiceState::Crashed;
            s.watcher = None;
            shared.persist(&name, &s);
            return;
        }

        if launched_at.elapsed() >= shared.backoff.reset_after {
            attempt = 0;
        }
        attempt += 1;
        s.restarts += 1;
        let delay = shared.backoff.delay_for(attempt);
        shared.persist(&name, &s);
        drop(s);
        debug!("[SUPERVISOR:{}] Restarting in {:?}", name, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }

        let mut s = slot.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if shared.stop_requested(&name) {
            info!("[SUPERVISOR:{}] Restart dropped, stopped from another sprout process", name);
            s.state = ServiceState::Stopped;
            s.watcher = None;
            return;
        }
        match process::launch(&name, &s.spec) {
            Ok(new_child) => {
                child = ServiceProcess::Owned(new_child);
                s.pid = child.pid();
                info!("[SUPERVISOR:{}] Restarted (pid {:?})", name, s.pid);
                shared.persist(&name, &s);
            }
            Err(e) => {
                error!("[SUPERVISOR:{}] Restart failed: {}", name, e);
                s.state = ServiceState::Crashed;
                s.last_exit = Some(e.to_string());
                s.watcher = None;
                shared.persist(&name, &s);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn supervisor(dir: &TempDir) -> Supervisor {
        Supervisor::with_settings(
            ServiceStore::new(dir.path().join("services")),
            RestartBackoff {
                base: Duration::from_millis(50),
                max: Duration::from_millis(200),
                reset_after: Duration::from_secs(60),
            },
            Duration::from_secs(2),
        )
    }

    fn sleeper(keep_alive: bool) -> ServiceSpec {
        ServiceSpec {
            command: vec!["sleep".into(), "30".into()],
            keep_alive,
            environment: Default::default(),
            stdout_log_path: None,
            stderr_log_path: None,
            working_dir: None,
        }
    }

    async fn wait_for<F>(sup: &Supervisor, name: &str, within: Duration, pred: F) -> ServiceStatus
    where
        F: Fn(&ServiceStatus) -> bool,
    {
        let deadline = Instant::now() + within;
        loop {
            let status = sup.status(name).await;
            if pred(&status) || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn kill(pid: u32) {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn unknown_service_is_unregistered() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        assert_eq!(sup.status("ghost").await.state, ServiceState::Unregistered);
        assert!(matches!(
            sup.start("ghost").await,
            Err(SproutError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_yields_one_process() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", sleeper(false), Path::new("/bin/sleep"))
            .await
            .unwrap();
        assert_eq!(sup.status("svc").await.state, ServiceState::Stopped);

        sup.start("svc").await.unwrap();
        let first = sup.status("svc").await;
        sup.start("svc").await.unwrap();
        let second = sup.status("svc").await;

        assert_eq!(first.state, ServiceState::Running);
        assert_eq!(first.pid, second.pid);
        assert!(process::is_alive(first.pid.unwrap()));

        sup.stop("svc").await.unwrap();
        let stopped = sup.status("svc").await;
        assert_eq!(stopped.state, ServiceState::Stopped);
        assert_eq!(stopped.pid, None);
    }

    #[tokio::test]
    async fn keep_alive_service_comes_back_after_external_kill() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", sleeper(true), Path::new("/bin/sleep"))
            .await
            .unwrap();
        sup.start("svc").await.unwrap();
        let old_pid = sup.status("svc").await.pid.unwrap();

        kill(old_pid);
        let status = wait_for(&sup, "svc", Duration::from_secs(3), |s| {
            s.pid.is_some_and(|p| p != old_pid)
        })
        .await;
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.restarts, 1);
        assert!(status.last_exit.as_deref().unwrap_or("").contains("signal 9"));

        sup.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn non_keep_alive_service_stays_crashed() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", sleeper(false), Path::new("/bin/sleep"))
            .await
            .unwrap();
        sup.start("svc").await.unwrap();
        let pid = sup.status("svc").await.pid.unwrap();

        kill(pid);
        let status = wait_for(&sup, "svc", Duration::from_secs(3), |s| {
            s.state == ServiceState::Crashed
        })
        .await;
        assert_eq!(status.state, ServiceState::Crashed);

        // Well past any backoff window: still not restarted.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let later = sup.status("svc").await;
        assert_eq!(later.state, ServiceState::Crashed);
        assert_eq!(later.pid, None);
        assert_eq!(later.restarts, 0);
    }

    #[tokio::test]
    async fn stop_cancels_pending_backoff() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::with_settings(
            ServiceStore::new(dir.path().join("services")),
            RestartBackoff {
                base: Duration::from_secs(30),
                max: Duration::from_secs(30),
                reset_after: Duration::from_secs(60),
            },
            Duration::from_secs(2),
        );
        sup.register("svc", sleeper(true), Path::new("/bin/sleep"))
            .await
            .unwrap();
        sup.start("svc").await.unwrap();
        kill(sup.status("svc").await.pid.unwrap());
        wait_for(&sup, "svc", Duration::from_secs(3), |s| s.pid.is_none()).await;

        let started = Instant::now();
        sup.stop("svc").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.status("svc").await.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::with_settings(
            ServiceStore::new(dir.path().join("services")),
            RestartBackoff::default(),
            Duration::from_millis(200),
        );
        let mut spec = sleeper(false);
        spec.command = vec![
            "/bin/sh".into(),
            "-c".into(),
            "trap '' TERM; while true; do sleep 1; done".into(),
        ];
        sup.register("stubborn", spec, Path::new("/bin/sh"))
            .await
            .unwrap();
        sup.start("stubborn").await.unwrap();
        let pid = sup.status("stubborn").await.pid.unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        sup.stop("stubborn").await.unwrap();
        assert_eq!(sup.status("stubborn").await.state, ServiceState::Stopped);
        assert!(!process::is_alive(pid));
    }

    #[tokio::test]
    async fn stop_for_upgrade_reports_prior_state() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", sleeper(true), Path::new("/bin/sleep"))
            .await
            .unwrap();

        assert!(!sup.stop_for_upgrade("svc").await.unwrap());
        sup.start("svc").await.unwrap();
        assert!(sup.stop_for_upgrade("svc").await.unwrap());
        assert_eq!(sup.status("svc").await.state, ServiceState::Stopped);
        assert!(!sup.stop_for_upgrade("never-registered").await.unwrap());
    }

    #[tokio::test]
    async fn reregistering_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.register("svc", sleeper(false), Path::new("/old/bin"))
            .await
            .unwrap();
        sup.start("svc").await.unwrap();
        let pid = sup.status("svc").await.pid;

        let mut updated = sleeper(true);
        updated.command[1] = "31".into();
        sup.register("svc", updated, Path::new("/new/bin")).await.unwrap();

        assert_eq!(sup.names(), vec!["svc"]);
        let status = sup.status("svc").await;
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.pid, pid);

        sup.deregister("svc").await.unwrap();
        assert_eq!(sup.status("svc").await.state, ServiceState::Unregistered);
        assert!(ServiceStore::new(dir.path().join("services"))
            .load("svc")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn a_new_supervisor_adopts_a_live_pid() {
        let dir = TempDir::new().unwrap();
        let first = supervisor(&dir);
        first
            .register("svc", sleeper(false), Path::new("/bin/sleep"))
            .await
            .unwrap();
        first.start("svc").await.unwrap();
        let pid = first.status("svc").await.pid.unwrap();
        first.detach_all().await;

        let second = supervisor(&dir);
        let status = second
            .reattach("svc", sleeper(false), Path::new("/bin/sleep"), false)
            .await
            .unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.pid, Some(pid));

        second.stop("svc").await.unwrap();
        assert_eq!(second.status("svc").await.state, ServiceState::Stopped);
        assert!(!process::is_alive(pid));
        let persisted = ServiceStore::new(dir.path().join("services"))
            .load("svc")
            .unwrap()
            .unwrap();
        assert!(!persisted.desired_running);
    }

    #[tokio::test]
    async fn a_stop_from_another_supervisor_is_not_treated_as_a_crash() {
        let dir = TempDir::new().unwrap();
        let store = ServiceStore::new(dir.path().join("services"));
        let daemon = supervisor(&dir);
        daemon
            .register("svc", sleeper(true), Path::new("/bin/sleep"))
            .await
            .unwrap();
        daemon.start("svc").await.unwrap();
        let pid = daemon.status("svc").await.pid.unwrap();

        // A one-shot command in a second process adopts the pid and stops it.
        let cli = supervisor(&dir);
        let adopted = cli
            .reattach("svc", sleeper(true), Path::new("/bin/sleep"), false)
            .await
            .unwrap();
        assert_eq!(adopted.pid, Some(pid));
        cli.stop("svc").await.unwrap();

        let status = wait_for(&daemon, "svc", Duration::from_secs(3), |s| {
            s.state == ServiceState::Stopped
        })
        .await;
        assert_eq!(status.state, ServiceState::Stopped);
        assert_eq!(status.pid, None);

        // Well past the backoff window: no restart, and the intent was not overwritten.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let later = daemon.status("svc").await;
        assert_eq!(later.state, ServiceState::Stopped);
        assert_eq!(later.restarts, 0);
        assert!(!process::is_alive(pid));
        assert!(!store.load("svc").unwrap().unwrap().desired_running);
    }

    #[tokio::test]
    async fn reattach_reports_without_rewriting_state() {
        let dir = TempDir::new().unwrap();
        let store = ServiceStore::new(dir.path().join("services"));
        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = exited.id();
        exited.wait().unwrap();
        let entry = PersistedService {
            name: "svc".into(),
            spec: sleeper(true),
            binary_path: "/bin/sleep".into(),
            desired_running: true,
            pid: Some(dead_pid),
            restarts: 2,
            updated_at: Utc::now(),
        };
        store.save(&entry).unwrap();
        let before = fs::read(dir.path().join("services").join("svc.json")).unwrap();

        let sup = supervisor(&dir);
        let status = sup
            .reattach("svc", sleeper(true), Path::new("/bin/sleep"), false)
            .await
            .unwrap();
        assert_eq!(status.state, ServiceState::Crashed);
        assert_eq!(status.restarts, 2);

        let after = fs::read(dir.path().join("services").join("svc.json")).unwrap();
        assert_eq!(before, after);
        let reloaded = store.load("svc").unwrap().unwrap();
        assert!(reloaded.desired_running);
        assert_eq!(reloaded.updated_at, entry.updated_at);
    }

    #[tokio::test]
    async fn a_process_that_outlives_sigkill_is_crashed_not_stopped() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("zombie.pid");
        // The backgrounded sleep exits and is never reaped by its parent, leaving a
        // zombie that kill(2) reports as present but no signal can remove.
        let mut parent = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(format!(
                "sleep 0.2 & echo $! > '{}'; exec sleep 30",
                pidfile.display()
            ))
            .spawn()
            .unwrap();
        let mut zombie = None;
        for _ in 0..50 {
            if let Some(pid) = fs::read_to_string(&pidfile)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok())
            {
                zombie = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let zombie = zombie.expect("background pid written");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let store = ServiceStore::new(dir.path().join("services"));
        store
            .save(&PersistedService {
                name: "svc".into(),
                spec: sleeper(false),
                binary_path: "/bin/sleep".into(),
                desired_running: true,
                pid: Some(zombie),
                restarts: 0,
                updated_at: Utc::now(),
            })
            .unwrap();
        let sup = Supervisor::with_settings(
            store.clone(),
            RestartBackoff::default(),
            Duration::from_millis(200),
        );
        let adopted = sup
            .reattach("svc", sleeper(false), Path::new("/bin/sleep"), false)
            .await
            .unwrap();
        assert_eq!(adopted.state, ServiceState::Running);

        let err = sup.stop("svc").await.unwrap_err();
        assert!(matches!(err, SproutError::ServiceOperationFailed { .. }));
        let status = sup.status("svc").await;
        assert_eq!(status.state, ServiceState::Crashed);
        assert_eq!(status.pid, Some(zombie));
        assert!(!store.load("svc").unwrap().unwrap().desired_running);

        parent.kill().unwrap();
        parent.wait().unwrap();
    }
}
