// sprout-net/src/lib.rs
pub mod fetch;
pub mod http;
pub mod stage;
pub mod validation;

pub use fetch::{DefaultFetcher, FetchError, Fetcher, LocalFetcher};
pub use http::HttpFetcher;
pub use stage::{fetch_and_verify, FetchControl, StagedArtifact, Verification};
pub use validation::{sha256_file, validate_url, verify_checksum};
