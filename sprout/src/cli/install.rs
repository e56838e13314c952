// sprout/src/cli/install.rs
use clap::Args;
use colored::Colorize;
use sprout_common::error::{Result, SproutError};
use sprout_common::keg::InstalledRecord;
use sprout_core::{InstallOutcome, ServiceState};
use tracing::debug;

use crate::cli::{finish, ohai, Manager};

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Formulas to install
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl InstallArgs {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let mut errors: Vec<(String, SproutError)> = Vec::new();
        for name in &self.names {
            ohai(format!("Installing {name}"));
            match manager.install(name).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            InstallOutcome::Installed(record) => {
                                report_installed(manager, &record).await
                            }
                            InstallOutcome::AlreadyInstalled(record) => println!(
                                "{} {} {} is already installed",
                                "✓".green(),
                                record.name.cyan(),
                                record.version
                            ),
                        }
                    }
                }
                Err(e) => {
                    debug!("Install of {} failed at stage {}", name, e.stage());
                    errors.push((name.clone(), e));
                }
            }
        }
        finish(errors)
    }
}

/// Summary lines shared by install and upgrade.
pub(crate) async fn report_installed(manager: &Manager, record: &InstalledRecord) {
    println!(
        "{} Installed {} {}",
        "✓".green().bold(),
        record.name.cyan(),
        record.version
    );
    for path in &record.binary_paths {
        println!("    {}", path.display());
    }
    if !record.verified {
        eprintln!(
            "{} {} was installed from an artifact with no checksum; its contents are unverified",
            "Warning:".yellow().bold(),
            record.name
        );
    }
    if record.service.is_some() {
        let status = manager.supervisor().status(&record.name).await;
        match (status.state, status.pid) {
            (ServiceState::Running, Some(pid)) => {
                println!("    service {} (pid {})", "running".green(), pid)
            }
            (state, _) => println!("    service {state}"),
        }
    }
}
