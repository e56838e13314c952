use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SproutError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Unsupported architecture '{0}' (expected one of: intel, arm)")]
    UnsupportedArchitecture(String),

    #[error("Formula '{name}' has no artifact for architecture '{arch}'")]
    NoArtifactForArchitecture { name: String, arch: String },

    #[error("Fetch failed for '{name}' from '{url}': {reason}")]
    FetchFailed {
        name: String,
        url: String,
        reason: String,
    },

    #[error("Checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Refusing unverified artifact for '{0}': no checksum provided and strict mode is on")]
    UnverifiedArtifact(String),

    #[error("Install failed for '{name}': {reason}")]
    InstallFailed { name: String, reason: String },

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Service operation '{operation}' failed for '{name}': {reason}")]
    ServiceOperationFailed {
        name: String,
        operation: &'static str,
        reason: String,
    },

    #[error("Invalid formula '{name}': {reason}")]
    InvalidFormula { name: String, reason: String },

    #[error("Operation cancelled for '{name}' during {stage}")]
    Cancelled { name: String, stage: &'static str },

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl SproutError {
    pub fn install_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstallFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn service_failed(
        name: impl Into<String>,
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::ServiceOperationFailed {
            name: name.into(),
            operation,
            reason: reason.into(),
        }
    }

    /// The pipeline stage a failure belongs to, for user-visible reporting.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::UnsupportedArchitecture(_) | Self::NoArtifactForArchitecture { .. } => "resolve",
            Self::FetchFailed { .. } | Self::Http(_) => "fetch",
            Self::ChecksumMismatch { .. } | Self::UnverifiedArtifact(_) => "verify",
            Self::InstallFailed { .. } => "install",
            Self::ServiceOperationFailed { .. } => "service",
            Self::NotFound(_) | Self::InvalidFormula { .. } => "registry",
            Self::Cancelled { stage, .. } => *stage,
            Self::Config(_) => "config",
            Self::Io(_)
            | Self::Json(_)
            | Self::SemVer(_)
            | Self::ValidationError(_)
            | Self::Generic(_) => "internal",
        }
    }

    /// Only transport failures are worth retrying; a bad checksum stays bad.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 2,
            Self::ChecksumMismatch { .. } => 3,
            Self::FetchFailed { .. } | Self::Http(_) => 4,
            Self::InstallFailed { .. } => 5,
            Self::UnsupportedArchitecture(_) | Self::NoArtifactForArchitecture { .. } => 6,
            Self::ServiceOperationFailed { .. } => 7,
            Self::UnverifiedArtifact(_) => 8,
            Self::InvalidFormula { .. } => 9,
            Self::Cancelled { .. } => 10,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for SproutError {
    fn from(err: std::io::Error) -> Self {
        SproutError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for SproutError {
    fn from(err: reqwest::Error) -> Self {
        SproutError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for SproutError {
    fn from(err: serde_json::Error) -> Self {
        SproutError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for SproutError {
    fn from(err: semver::Error) -> Self {
        SproutError::SemVer(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, SproutError>;
