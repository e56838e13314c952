// sprout/src/cli/upgrade.rs
use clap::Args;
use colored::Colorize;
use sprout_common::error::{Result, SproutError};
use sprout_core::UpgradeOutcome;

use crate::cli::install::report_installed;
use crate::cli::{finish, ohai, Manager};

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    /// Formulas to upgrade; ones not yet installed are installed
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl UpgradeArgs {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let mut errors: Vec<(String, SproutError)> = Vec::new();
        for name in &self.names {
            ohai(format!("Upgrading {name}"));
            match manager.upgrade(name).await {
                Ok(UpgradeOutcome::UpToDate(record)) => println!(
                    "{} {} {} is already up to date",
                    "✓".green(),
                    record.name.cyan(),
                    record.version
                ),
                Ok(UpgradeOutcome::Upgraded { from, record }) => {
                    println!("    {} -> {}", from.dimmed(), record.version.bold());
                    report_installed(manager, &record).await;
                }
                Ok(UpgradeOutcome::Installed(record)) => report_installed(manager, &record).await,
                Err(e) => errors.push((name.clone(), e)),
            }
        }
        finish(errors)
    }
}
