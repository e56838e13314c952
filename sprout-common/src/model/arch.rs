// sprout-common/src/model/arch.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SproutError};

/// CPU architectures a formula can ship artifacts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Intel,
    Arm,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::Intel, Architecture::Arm];

    /// Architecture of the running process.
    pub fn current() -> Result<Self> {
        Self::from_target_arch(std::env::consts::ARCH)
    }

    /// Maps a Rust `target_arch` name onto the closed architecture set.
    pub fn from_target_arch(target_arch: &str) -> Result<Self> {
        match target_arch {
            "x86_64" => Ok(Self::Intel),
            "aarch64" => Ok(Self::Arm),
            other => Err(SproutError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intel => "intel",
            Self::Arm => "arm",
        }
    }
}

impl FromStr for Architecture {
    type Err = SproutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "intel" => Ok(Self::Intel),
            "arm" => Ok(Self::Arm),
            other => Err(SproutError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
