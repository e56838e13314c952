// sprout-core/src/supervisor/process.rs
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use sprout_common::error::{Result, SproutError};
use sprout_common::model::ServiceSpec;
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

/// Search path given to services whose environment has no PATH at all.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Ambient environment, plus a default PATH when none is set, overlaid with the
/// service's own variables. Service values win on collision.
pub fn merged_environment(spec: &ServiceSpec) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    for (key, value) in &spec.environment {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Opens a log in append mode, creating parent directories. Called on every launch so a
/// restarted process never inherits a handle from a previous one.
fn open_log(path: Option<&Path>) -> io::Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file: File = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Stdio::from(file))
}

/// Spawns the service in its own process group with logs redirected.
pub fn launch(name: &str, spec: &ServiceSpec) -> Result<Child> {
    let fail = |reason: String| {
        error!("[SUPERVISOR:{}] Launch failed: {}", name, reason);
        SproutError::service_failed(name, "start", reason)
    };
    let program = spec
        .program()
        .ok_or_else(|| fail("service command is empty".to_string()))?;

    let stdout = open_log(spec.stdout_log_path.as_deref())
        .map_err(|e| fail(format!("cannot open stdout log: {e}")))?;
    let stderr = open_log(spec.stderr_log_path.as_deref())
        .map_err(|e| fail(format!("cannot open stderr log: {e}")))?;

    let mut cmd = Command::new(program);
    cmd.args(&spec.command[1..]);
    cmd.env_clear();
    cmd.envs(merged_environment(spec));
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(stdout);
    cmd.stderr(stderr);
    // Own group: terminal signals aimed at sprout do not reach the service, and stop can
    // signal the whole tree.
    cmd.process_group(0);
    cmd.kill_on_drop(false);

    let child = cmd
        .spawn()
        .map_err(|e| fail(format!("cannot execute '{program}': {e}")))?;
    debug!(
        "[SUPERVISOR:{}] Launched '{}' (pid {:?})",
        name,
        program,
        child.id()
    );
    Ok(child)
}

/// Delivers `signal` to the process group led by `pid`, falling back to the single process.
pub fn signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(err)
}

/// Reaps `pid` if it is an exited child of this process. Other pids are left alone.
fn reap_if_exited_child(pid: u32) -> bool {
    let mut status: libc::c_int = 0;
    // SAFETY: WNOHANG never blocks; a pid that is not our child yields ECHILD.
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    rc == pid as libc::pid_t
}

pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {code}"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        _ => "exited".to_string(),
    }
}

/// A service process: either spawned by this sprout process or adopted by pid from a
/// previous one.
#[derive(Debug)]
pub enum ServiceProcess {
    Owned(Child),
    Adopted(u32),
}

impl ServiceProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Owned(child) => child.id(),
            Self::Adopted(pid) => Some(*pid),
        }
    }

    /// Resolves once the process is gone, reaping it if it is ours.
    pub async fn wait(&mut self) -> String {
        match self {
            Self::Owned(child) => match child.wait().await {
                Ok(status) => describe_exit(&status),
                Err(e) => {
                    warn!("wait() on service child failed: {}", e);
                    format!("wait failed: {e}")
                }
            },
            Self::Adopted(pid) => {
                while !reap_if_exited_child(*pid) && is_alive(*pid) {
                    tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
                }
                "exited (adopted process, status unknown)".to_string()
            }
        }
    }
}
