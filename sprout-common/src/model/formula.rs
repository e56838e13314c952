// sprout-common/src/model/formula.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::arch::Architecture;
use super::service::ServiceSpec;

/// Where to download one architecture's archive from, and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub url: String,
    /// Hex SHA-256. Empty means the artifact cannot be verified.
    #[serde(default)]
    pub checksum: String,
}

impl ArtifactDescriptor {
    pub fn new(url: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            checksum: checksum.into(),
        }
    }

    /// The expected digest, or `None` when verification has to be skipped.
    pub fn expected_sha256(&self) -> Option<&str> {
        let trimmed = self.checksum.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// File name the URL points at, used to keep the archive extension while staging.
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|s| !s.is_empty())
    }
}

/// One `bin.install "x"` style entry: copy `source` from the archive into `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallTarget {
    pub source: String,
    /// Directory, relative to the prefix unless absolute. Placeholders allowed.
    pub destination: String,
}

/// Smoke test run against the installed binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaTest {
    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
    /// Substring the output must contain. Defaults to the formula version.
    #[serde(default)]
    pub expect: Option<String>,
}

fn default_test_args() -> Vec<String> {
    vec!["--version".to_string()]
}

impl Default for FormulaTest {
    fn default() -> Self {
        Self {
            args: default_test_args(),
            expect: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub runtime_dependency: Option<String>,
    pub artifacts: BTreeMap<Architecture, ArtifactDescriptor>,
    #[serde(default)]
    pub install_targets: Vec<InstallTarget>,
    #[serde(default)]
    pub service: Option<ServiceSpec>,
    #[serde(default)]
    pub test: Option<FormulaTest>,
}

impl Formula {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn has_service(&self) -> bool {
        self.service.is_some()
    }

    /// Raw descriptor for `arch`, before `{version}` substitution.
    pub fn artifact(&self, arch: Architecture) -> Option<&ArtifactDescriptor> {
        self.artifacts.get(&arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MUSIC_DISCORD_RPC: &str = r#"{
        "name": "music-discord-rpc",
        "desc": "Cross-platform Discord rich presence for music",
        "homepage": "https://github.com/patryk-ku/music-discord-rpc",
        "license": "MIT",
        "version": "0.5.1",
        "runtime_dependency": "media-control",
        "artifacts": {
            "intel": { "url": "https://example.com/v{version}/music-discord-rpc-macos-amd64.tar.gz", "checksum": "" },
            "arm": { "url": "https://example.com/v{version}/music-discord-rpc-macos-arm64.tar.gz" }
        },
        "install_targets": [ { "source": "music-discord-rpc", "destination": "bin" } ],
        "service": {
            "command": ["{opt_bin}/music-discord-rpc"],
            "keep_alive": true,
            "environment": { "PATH": "{prefix}/bin:/usr/bin:/bin" },
            "stdout_log_path": "{var}/log/music-discord-rpc.log",
            "stderr_log_path": "{var}/log/music-discord-rpc.error.log"
        },
        "test": {}
    }"#;

    #[test]
    fn deserializes_a_service_formula() {
        let formula: Formula = serde_json::from_str(MUSIC_DISCORD_RPC).unwrap();
        assert_eq!(formula.name(), "music-discord-rpc");
        assert_eq!(formula.runtime_dependency.as_deref(), Some("media-control"));
        assert_eq!(formula.artifacts.len(), 2);
        let arm = formula.artifact(Architecture::Arm).unwrap();
        assert_eq!(arm.expected_sha256(), None);
        assert_eq!(arm.file_name(), Some("music-discord-rpc-macos-arm64.tar.gz"));
        let service = formula.service.as_ref().unwrap();
        assert!(service.keep_alive);
        assert_eq!(service.environment.len(), 1);
        assert_eq!(formula.test.as_ref().unwrap().args, vec!["--version"]);
    }

    #[test]
    fn library_formula_has_no_service() {
        let formula: Formula = serde_json::from_str(
            r#"{ "name": "media-control", "version": "0.4.0",
                 "artifacts": { "arm": { "url": "https://example.com/m.tar.gz", "checksum": "ab" } } }"#,
        )
        .unwrap();
        assert!(!formula.has_service());
        assert!(formula.install_targets.is_empty());
        assert_eq!(
            formula.artifact(Architecture::Arm).unwrap().expected_sha256(),
            Some("ab")
        );
        assert!(formula.artifact(Architecture::Intel).is_none());
    }
}
