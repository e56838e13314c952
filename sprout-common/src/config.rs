// sprout-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::UserDirs;
use tracing::debug;

use super::error::{Result, SproutError};

// Used when neither SPROUT_PREFIX nor a home directory is available.
const DEFAULT_FALLBACK_SPROUT_ROOT: &str = "/opt/sprout";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FETCH_RETRIES: u32 = 3;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 1_000;
const DEFAULT_RESTART_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_RESTART_RESET_SECS: u64 = 60;

/// Restart pacing for keep-alive services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBackoff {
    pub base: Duration,
    pub max: Duration,
    /// A process that stayed up this long resets the crash counter.
    pub reset_after: Duration,
}

impl RestartBackoff {
    /// Delay before restart attempt `attempt` (1-based), doubling up to `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max)
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_RESTART_BACKOFF_MS),
            max: Duration::from_millis(DEFAULT_RESTART_BACKOFF_MAX_MS),
            reset_after: Duration::from_secs(DEFAULT_RESTART_RESET_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sprout_root: PathBuf,
    pub formula_dir: PathBuf,
    pub strict_checksums: bool,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
    pub stop_grace_period: Duration,
    pub restart_backoff: RestartBackoff,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading sprout configuration");

        let sprout_root = match env::var("SPROUT_PREFIX").ok().filter(|s| !s.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => {
                let fallback = UserDirs::new()
                    .map(|ud| ud.home_dir().join(".sprout"))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_SPROUT_ROOT));
                debug!(
                    "SPROUT_PREFIX not set or empty, falling back to: {}",
                    fallback.display()
                );
                fallback
            }
        };
        if !sprout_root.is_absolute() {
            return Err(SproutError::Config(format!(
                "SPROUT_PREFIX must be an absolute path, got '{}'",
                sprout_root.display()
            )));
        }

        let mut config = Self::with_prefix(&sprout_root);

        if let Some(dir) = env::var("SPROUT_FORMULA_DIR").ok().filter(|s| !s.is_empty()) {
            config.formula_dir = PathBuf::from(dir);
        }
        config.strict_checksums = env_flag("SPROUT_STRICT_CHECKSUMS");
        config.fetch_timeout =
            Duration::from_secs(env_number("SPROUT_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?);
        config.fetch_retries = env_u32("SPROUT_FETCH_RETRIES", DEFAULT_FETCH_RETRIES)?;
        config.stop_grace_period =
            Duration::from_secs(env_number("SPROUT_STOP_GRACE_SECS", DEFAULT_STOP_GRACE_SECS)?);
        config.restart_backoff.base = Duration::from_millis(env_number(
            "SPROUT_RESTART_BACKOFF_MS",
            DEFAULT_RESTART_BACKOFF_MS,
        )?);
        config.restart_backoff.max = Duration::from_millis(env_number(
            "SPROUT_RESTART_BACKOFF_MAX_MS",
            DEFAULT_RESTART_BACKOFF_MAX_MS,
        )?);

        debug!(
            "Configuration loaded successfully (root: {}).",
            config.sprout_root.display()
        );
        Ok(config)
    }

    /// Configuration rooted at `root` with default tunables, ignoring the environment.
    pub fn with_prefix(root: &Path) -> Self {
        Self {
            sprout_root: root.to_path_buf(),
            formula_dir: root.join("Formula"),
            strict_checksums: false,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            fetch_retries: DEFAULT_FETCH_RETRIES,
            stop_grace_period: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            restart_backoff: RestartBackoff::default(),
        }
    }

    pub fn sprout_root(&self) -> &Path {
        &self.sprout_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.sprout_root.join("bin")
    }

    pub fn var_dir(&self) -> PathBuf {
        self.sprout_root.join("var")
    }

    /// Where service stdout/stderr logs conventionally go.
    pub fn log_dir(&self) -> PathBuf {
        self.var_dir().join("log")
    }

    fn internal_dir(&self) -> PathBuf {
        self.var_dir().join("sprout")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.internal_dir().join("state")
    }

    pub fn installed_state_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn service_state_dir(&self) -> PathBuf {
        self.state_dir().join("services")
    }

    /// Staging area. Lives under the prefix so promotion is a same-filesystem rename.
    pub fn tmp_dir(&self) -> PathBuf {
        self.internal_dir().join("tmp")
    }

    /// sprout's own log files (not service logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.internal_dir().join("logs")
    }

    pub fn formula_dir(&self) -> &Path {
        &self.formula_dir
    }

    /// Expands `{prefix}`, `{bin}`, `{opt_bin}` and `{var}` placeholders.
    pub fn expand(&self, raw: &str) -> String {
        if !raw.contains('{') {
            return raw.to_string();
        }
        let bin = self.bin_dir();
        raw.replace("{prefix}", &self.sprout_root.to_string_lossy())
            .replace("{opt_bin}", &bin.to_string_lossy())
            .replace("{bin}", &bin.to_string_lossy())
            .replace("{var}", &self.var_dir().to_string_lossy())
    }

    /// Expands placeholders and anchors relative paths at the prefix root.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(self.expand(raw));
        if expanded.is_absolute() {
            expanded
        } else {
            self.sprout_root.join(expanded)
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_number(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<u64>().map_err(|e| {
            SproutError::Config(format!("{key} must be a non-negative integer, got '{raw}': {e}"))
        }),
        _ => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    let value = env_number(key, u64::from(default))?;
    u32::try_from(value).map_err(|_| {
        SproutError::Config(format!("{key} must be at most {}, got {value}", u32::MAX))
    })
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
