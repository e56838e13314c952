// sprout-net/src/http.rs
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use sprout_common::error::{Result, SproutError};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::fetch::{FetchError, Fetcher};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "sprout formula installer (Rust; +https://github.com/alexykn/sprout)";

/// Streams remote artifacts over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| SproutError::Generic(format!("Failed to build HTTP client: {e}")))
}

impl Fetcher for HttpFetcher {
    fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = std::result::Result<u64, FetchError>> + Send {
        let request = self.client.get(url);
        let url = url.to_string();
        let dest = dest.to_path_buf();
        async move {
            let response = request.send().await.map_err(|e| {
                debug!("HTTP request failed for {url}: {e}");
                FetchError::Transport(e.to_string())
            })?;
            let status = response.status();
            debug!("Received HTTP status: {} for {}", status, url);
            if !status.is_success() {
                error!("HTTP error {} for URL {}", status, url);
                return Err(FetchError::Status(status.as_u16()));
            }

            let mut file = TokioFile::create(&dest).await?;
            let mut written: u64 = 0;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| FetchError::Transport(e.to_string()))?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            debug!("Finished writing {} bytes to {}", written, dest.display());
            Ok(written)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use sprout_common::model::ArtifactDescriptor;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::stage::{fetch_and_verify, FetchControl};

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    /// Serves one canned response per connection; `None` drops the connection unanswered.
    async fn serve(response: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                if let Some(response) = response {
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            }
        });
        format!("http://{addr}/pkg-1.0.0-arm.tar.gz")
    }

    /// Ambient proxy settings must not intercept loopback requests.
    fn local_fetcher() -> HttpFetcher {
        HttpFetcher::with_client(Client::builder().no_proxy().build().unwrap())
    }

    fn staged_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn non_success_status_is_a_retryable_fetch_failure() {
        let url = serve(Some(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ))
        .await;
        let staging = TempDir::new().unwrap();
        let descriptor = ArtifactDescriptor::new(url, ABC_SHA256);
        let control = FetchControl::new(Duration::from_secs(10));

        let fetcher = local_fetcher();
        let err = fetch_and_verify("pkg", &descriptor, staging.path(), &fetcher, &control)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SproutError::FetchFailed { ref reason, .. } if reason.contains("404")),
            "{err:?}"
        );
        assert!(err.is_retryable());
        assert_eq!(err.stage(), "fetch");
        assert_eq!(staged_entries(staging.path()), 0);
    }

    #[tokio::test]
    async fn dropped_connection_is_a_retryable_fetch_failure() {
        let url = serve(None).await;
        let staging = TempDir::new().unwrap();
        let descriptor = ArtifactDescriptor::new(url, "");
        let control = FetchControl::new(Duration::from_secs(10));

        let fetcher = local_fetcher();
        let err = fetch_and_verify("pkg", &descriptor, staging.path(), &fetcher, &control)
            .await
            .unwrap_err();
        assert!(matches!(err, SproutError::FetchFailed { .. }), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(staged_entries(staging.path()), 0);
    }

    #[tokio::test]
    async fn successful_body_is_streamed_and_verified() {
        let url = serve(Some(
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        ))
        .await;
        let staging = TempDir::new().unwrap();
        let descriptor = ArtifactDescriptor::new(url, ABC_SHA256);
        let control = FetchControl::new(Duration::from_secs(10));

        let fetcher = local_fetcher();
        let staged = fetch_and_verify("pkg", &descriptor, staging.path(), &fetcher, &control)
            .await
            .unwrap();
        assert!(staged.is_verified());
        assert_eq!(staged.size_bytes, 3);
        drop(staged);
        assert_eq!(staged_entries(staging.path()), 0);
    }
}
