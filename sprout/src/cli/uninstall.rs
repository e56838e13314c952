// sprout/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use sprout_common::error::{Result, SproutError};

use crate::cli::{finish, Manager};

#[derive(Args, Debug)]
pub struct Uninstall {
    /// Formulas to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,
}

impl Uninstall {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let mut errors: Vec<(String, SproutError)> = Vec::new();
        for name in &self.names {
            println!("Uninstalling {name}...");
            match manager.uninstall(name).await {
                Ok(record) => {
                    println!(
                        "{} Uninstalled {} {} ({} file(s) removed)",
                        "✓".green().bold(),
                        record.name.cyan(),
                        record.version,
                        record.binary_paths.len()
                    );
                }
                Err(e) => errors.push((name.clone(), e)),
            }
        }
        finish(errors)
    }
}
