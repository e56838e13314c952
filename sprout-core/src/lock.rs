// sprout-core/src/lock.rs
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sprout_common::error::{Result, SproutError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

const FLOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-name operation locks. An async mutex orders tasks inside this process and an
/// advisory `flock` on `<dir>/<name>.lock` orders separate sprout processes.
#[derive(Debug, Clone)]
pub struct NameLocks {
    dir: PathBuf,
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held for the duration of one operation. Dropping it closes the lock file, which
/// releases the `flock`.
#[derive(Debug)]
pub struct NameGuard {
    _file: File,
    _local: OwnedMutexGuard<()>,
}

impl NameLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::default(),
        }
    }

    /// Waits for exclusive access to `name`, across tasks and processes.
    pub async fn acquire(&self, name: &str) -> Result<NameGuard> {
        let local = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        trace!("Acquiring operation lock for '{}'", name);
        let local = local.lock_owned().await;

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let mut announced = false;
        loop {
            // SAFETY: the fd stays open for the lifetime of `file`.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {
                    if !announced {
                        debug!("'{}' is locked by another sprout process, waiting", name);
                        announced = true;
                    }
                    tokio::time::sleep(FLOCK_POLL_INTERVAL).await;
                }
                _ => {
                    return Err(SproutError::Generic(format!(
                        "cannot lock {}: {err}",
                        path.display()
                    )))
                }
            }
        }
        Ok(NameGuard {
            _file: file,
            _local: local,
        })
    }
}
