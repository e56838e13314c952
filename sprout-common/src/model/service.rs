// sprout-common/src/model/service.rs
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// How to run an installed binary as a background service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// argv; the first element is the program.
    pub command: Vec<String>,
    #[serde(default)]
    pub keep_alive: bool,
    /// Merged over the ambient environment; these values win on collision.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout_log_path: Option<PathBuf>,
    #[serde(default)]
    pub stderr_log_path: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ServiceSpec {
    /// Returns a copy with every placeholder expanded against `config`.
    pub fn expanded(&self, config: &Config) -> Self {
        let expand_path = |p: &PathBuf| config.resolve_path(&p.to_string_lossy());
        Self {
            command: self.command.iter().map(|arg| config.expand(arg)).collect(),
            keep_alive: self.keep_alive,
            environment: self
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), config.expand(v)))
                .collect(),
            stdout_log_path: self.stdout_log_path.as_ref().map(expand_path),
            stderr_log_path: self.stderr_log_path.as_ref().map(expand_path),
            working_dir: self.working_dir.as_ref().map(expand_path),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn expansion_rewrites_command_env_and_logs() {
        let config = Config::with_prefix(Path::new("/srv/sprout"));
        let spec = ServiceSpec {
            command: vec!["{opt_bin}/mpris-discord-rpc".into(), "--debug-log".into()],
            keep_alive: true,
            environment: BTreeMap::from([("PATH".into(), "{prefix}/bin:/usr/bin".into())]),
            stdout_log_path: Some(PathBuf::from("{var}/log/mpris.log")),
            stderr_log_path: None,
            working_dir: None,
        };
        let expanded = spec.expanded(&config);
        assert_eq!(
            expanded.program(),
            Some("/srv/sprout/bin/mpris-discord-rpc")
        );
        assert_eq!(expanded.command[1], "--debug-log");
        assert_eq!(expanded.environment["PATH"], "/srv/sprout/bin:/usr/bin");
        assert_eq!(
            expanded.stdout_log_path,
            Some(PathBuf::from("/srv/sprout/var/log/mpris.log"))
        );
        assert!(expanded.keep_alive);
    }
}
