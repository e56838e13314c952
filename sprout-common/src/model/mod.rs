// sprout-common/src/model/mod.rs
pub mod arch;
pub mod formula;
pub mod service;

// Re-export
pub use arch::Architecture;
pub use formula::{ArtifactDescriptor, Formula, FormulaTest, InstallTarget};
pub use service::ServiceSpec;
