// sprout-common/src/lib.rs
pub mod config;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;

// Re-export key types
pub use config::Config;
pub use error::{Result, SproutError};
pub use formulary::Formulary;
pub use keg::{InstalledRecord, KegRegistry};
pub use model::{Architecture, ArtifactDescriptor, Formula, ServiceSpec};
