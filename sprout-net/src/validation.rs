// sprout-net/src/validation.rs
use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use sprout_common::error::{Result, SproutError};
use url::{Host, Url};

/// Hex-encoded SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes_copied = io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    tracing::debug!(
        "Calculated SHA256 for {}: {} ({} bytes read)",
        path.display(),
        actual,
        bytes_copied
    );
    Ok(actual)
}

/// Verifies that the file at `path` hashes to `expected` (case-insensitive hex).
pub fn verify_checksum(name: &str, path: &Path, expected: &str) -> Result<String> {
    tracing::debug!("Verifying checksum for: {}", path.display());
    let actual = sha256_file(path)?;
    tracing::debug!("Expected SHA256:   {}", expected);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(actual)
    } else {
        Err(SproutError::ChecksumMismatch {
            name: name.to_string(),
            expected: expected.trim().to_string(),
            actual,
        })
    }
}

/// Accepted artifact locations: `https://` remotes, `file://` URLs and absolute paths.
/// Plain `http://` is only accepted for loopback hosts such as a local mirror.
pub fn validate_url(url_str: &str) -> Result<()> {
    if Path::new(url_str).is_absolute() {
        return Ok(());
    }
    let url = Url::parse(url_str)
        .map_err(|e| SproutError::ValidationError(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(()),
        "http" if is_loopback(&url) => Ok(()),
        other => Err(SproutError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': must be https or file, but got '{other}'"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn known_digest_verifies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), ABC_SHA256);
        assert!(verify_checksum("abc", &path, &ABC_SHA256.to_uppercase()).is_ok());
    }

    #[test]
    fn any_flipped_bit_is_a_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload");
        let original: Vec<u8> = (0u8..=255).collect();
        fs::write(&path, &original).unwrap();
        let good = sha256_file(&path).unwrap();

        for (byte, bit) in [(0usize, 0u8), (127, 3), (255, 7)] {
            let mut flipped = original.clone();
            flipped[byte] ^= 1 << bit;
            fs::write(&path, &flipped).unwrap();
            let err = verify_checksum("payload", &path, &good).unwrap_err();
            assert!(matches!(err, SproutError::ChecksumMismatch { ref name, .. } if name == "payload"));
        }
    }

    #[test]
    fn url_schemes() {
        assert!(validate_url("https://github.com/a/b.tar.gz").is_ok());
        assert!(validate_url("file:///tmp/b.tar.gz").is_ok());
        assert!(validate_url("/tmp/b.tar.gz").is_ok());
        assert!(validate_url("http://github.com/a/b.tar.gz").is_err());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("http://127.0.0.1:8080/b.tar.gz").is_ok());
        assert!(validate_url("http://localhost/b.tar.gz").is_ok());
        assert!(validate_url("http://[::1]/b.tar.gz").is_ok());
        assert!(validate_url("http://10.0.0.1/b.tar.gz").is_err());
    }
}
