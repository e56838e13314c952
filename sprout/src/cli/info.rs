// sprout/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use sprout_common::error::Result;

use crate::cli::service::colored_state;
use crate::cli::Manager;

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,

    /// Print the formula and install state as JSON
    #[arg(long)]
    pub json: bool,
}

impl Info {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let info = manager.info(&self.name).await?;
        let formula = &info.formula;

        if self.json {
            let value = serde_json::json!({
                "formula": formula.as_ref(),
                "installed": info.installed,
                "service": info.service,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        println!("{} {}", formula.name.green().bold(), formula.version.bold());
        if let Some(desc) = &formula.desc {
            println!("{desc}");
        }
        if let Some(homepage) = &formula.homepage {
            println!("{}", homepage.blue().underline());
        }
        if let Some(license) = &formula.license {
            println!("License: {license}");
        }
        if let Some(dep) = &formula.runtime_dependency {
            println!("Depends on: {dep}");
        }

        let arch = manager.architecture();
        match formula.artifact(arch) {
            Some(artifact) if artifact.expected_sha256().is_some() => {
                println!("Artifact ({arch}): {}", artifact.url)
            }
            Some(artifact) => println!(
                "Artifact ({arch}): {} {}",
                artifact.url,
                "(no checksum)".yellow()
            ),
            None => println!("{}", format!("No artifact for {arch}").red()),
        }

        match &info.installed {
            Some(record) => {
                println!(
                    "Installed: {} on {}{}",
                    record.version,
                    record.installed_at.format("%Y-%m-%d %H:%M UTC"),
                    if record.verified { "" } else { " (unverified)" }
                );
                for path in &record.binary_paths {
                    println!("    {}", path.display());
                }
            }
            None => println!("Not installed"),
        }

        if let Some(status) = &info.service {
            let pid = status
                .pid
                .map(|p| format!(" (pid {p})"))
                .unwrap_or_default();
            println!("Service: {}{}", colored_state(status.state), pid);
        }
        Ok(())
    }
}
