// sprout-core/src/lib.rs
pub mod install;
pub mod lock;
pub mod manager;
pub mod resolve;
pub mod supervisor;

pub use manager::{FormulaInfo, InstallOutcome, ListEntry, PackageManager, UpgradeOutcome};
pub use resolve::resolve;
pub use supervisor::{ServiceState, ServiceStatus, Supervisor};
