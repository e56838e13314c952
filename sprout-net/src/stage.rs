// sprout-net/src/stage.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use sprout_common::error::{Result, SproutError};
use sprout_common::model::ArtifactDescriptor;
use tempfile::{Builder as TempBuilder, TempPath};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::fetch::Fetcher;
use crate::validation::{sha256_file, validate_url, verify_checksum};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { sha256: String },
    /// No checksum was declared; the content is untrusted.
    Unverified { sha256: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    pub fn sha256(&self) -> &str {
        match self {
            Self::Verified { sha256 } | Self::Unverified { sha256 } => sha256,
        }
    }
}

/// A downloaded artifact sitting in the staging area. The file is deleted on drop.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
    pub verification: Verification,
    pub size_bytes: u64,
}

impl StagedArtifact {
    /// Takes ownership of an existing file in the staging area; it is deleted on drop.
    pub fn adopt(path: PathBuf, verification: Verification) -> Result<Self> {
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self {
            path: TempPath::from_path(path),
            verification,
            size_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_verified(&self) -> bool {
        self.verification.is_verified()
    }
}

/// Limits applied to one fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchControl {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl FetchControl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }
}

/// Downloads `descriptor` into a uniquely named file under `staging_dir` and checks its hash.
///
/// Nothing outside `staging_dir` is touched. On every error path the partial file is
/// removed before returning. A descriptor without a checksum yields an
/// [`Verification::Unverified`] artifact; deciding whether to accept it is the caller's job.
#[instrument(skip(descriptor, staging_dir, fetcher, control), fields(url = %descriptor.url))]
pub async fn fetch_and_verify<F: Fetcher>(
    name: &str,
    descriptor: &ArtifactDescriptor,
    staging_dir: &Path,
    fetcher: &F,
    control: &FetchControl,
) -> Result<StagedArtifact> {
    validate_url(&descriptor.url)?;
    tokio::fs::create_dir_all(staging_dir).await?;

    let suffix = descriptor
        .file_name()
        .map(|f| format!("-{f}"))
        .unwrap_or_default();
    let temp = TempBuilder::new()
        .prefix(&format!(".{name}-"))
        .suffix(&suffix)
        .tempfile_in(staging_dir)?
        .into_temp_path();
    debug!("Downloading {} to staging file {}", descriptor.url, temp.display());

    let fetch_failed = |reason: String| SproutError::FetchFailed {
        name: name.to_string(),
        url: descriptor.url.clone(),
        reason,
    };

    let size_bytes = tokio::select! {
        biased;
        _ = control.cancel.cancelled() => {
            return Err(SproutError::Cancelled { name: name.to_string(), stage: "fetch" });
        }
        _ = tokio::time::sleep(control.timeout) => {
            return Err(fetch_failed(format!("timed out after {:?}", control.timeout)));
        }
        result = fetcher.fetch_to(&descriptor.url, &temp) => {
            result.map_err(|e| fetch_failed(e.to_string()))?
        }
    };

    let verification = hash_staged(name, temp.to_path_buf(), descriptor.expected_sha256()).await?;
    if !verification.is_verified() {
        warn!(
            "No checksum declared for '{}' ({}); artifact is unverified.",
            name, descriptor.url
        );
    }

    Ok(StagedArtifact {
        path: temp,
        verification,
        size_bytes,
    })
}

async fn hash_staged(name: &str, path: PathBuf, expected: Option<&str>) -> Result<Verification> {
    let name = name.to_string();
    let expected = expected.map(str::to_string);
    tokio::task::spawn_blocking(move || match expected {
        Some(expected) => {
            verify_checksum(&name, &path, &expected).map(|sha256| Verification::Verified { sha256 })
        }
        None => sha256_file(&path).map(|sha256| Verification::Unverified { sha256 }),
    })
    .await
    .map_err(|e| SproutError::Generic(format!("JoinError while hashing staged artifact: {e}")))?
}
