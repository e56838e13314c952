// sprout-net/src/fetch.rs
use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::debug;
use url::Url;

use crate::http::HttpFetcher;

/// Transport-level failure, before it is attributed to a formula.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported location '{0}'")]
    Unsupported(String),
}

/// Pluggable transport. Implementations write the full body of `url` to `dest`
/// (creating or truncating it) and report the number of bytes written.
pub trait Fetcher: Send + Sync {
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send;
}

/// Copies `file://` URLs and absolute paths.
#[derive(Debug, Default, Clone)]
pub struct LocalFetcher;

impl LocalFetcher {
    fn source_path(url: &str) -> Result<PathBuf, FetchError> {
        if Path::new(url).is_absolute() {
            return Ok(PathBuf::from(url));
        }
        Url::parse(url)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| FetchError::Unsupported(url.to_string()))
    }
}

impl Fetcher for LocalFetcher {
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send {
        let source = Self::source_path(url);
        let dest = dest.to_path_buf();
        async move {
            let source = source?;
            debug!("Copying local artifact {} -> {}", source.display(), dest.display());
            Ok(fs::copy(&source, &dest).await?)
        }
    }
}

/// Dispatches on the URL scheme: local sources to [`LocalFetcher`], the rest to HTTP.
#[derive(Debug, Clone)]
pub struct DefaultFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl DefaultFetcher {
    pub fn new() -> sprout_common::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new()?,
            local: LocalFetcher,
        })
    }
}

fn is_local(url: &str) -> bool {
    Path::new(url).is_absolute() || url.starts_with("file://")
}

impl Fetcher for DefaultFetcher {
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send {
        let local = is_local(url);
        let url = url.to_string();
        let dest = dest.to_path_buf();
        async move {
            if local {
                self.local.fetch_to(&url, &dest).await
            } else {
                self.http.fetch_to(&url, &dest).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn local_fetcher_accepts_file_urls_and_paths() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("artifact.tar.gz");
        std::fs::write(&src, b"payload").unwrap();

        let dest = dir.path().join("copy-1");
        let url = Url::from_file_path(&src).unwrap().to_string();
        assert_eq!(LocalFetcher.fetch_to(&url, &dest).await.unwrap(), 7);

        let dest = dir.path().join("copy-2");
        let path = src.to_string_lossy().to_string();
        assert_eq!(LocalFetcher.fetch_to(&path, &dest).await.unwrap(), 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn local_fetcher_rejects_remote_urls() {
        let dir = TempDir::new().unwrap();
        let err = LocalFetcher
            .fetch_to("https://example.com/x.tar.gz", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
    }

    #[test]
    fn scheme_dispatch() {
        assert!(is_local("/tmp/a.tar.gz"));
        assert!(is_local("file:///tmp/a.tar.gz"));
        assert!(!is_local("https://example.com/a.tar.gz"));
    }
}
