// sprout/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use sprout_common::error::Result;

use crate::cli::service::colored_state;
use crate::cli::Manager;

#[derive(Args, Debug)]
pub struct List {
    /// Also list formulas that are known but not installed
    #[arg(long)]
    pub available: bool,
}

impl List {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let installed = manager.list().await?;

        if installed.is_empty() {
            println!("{}", "0 formulas installed".yellow());
        } else {
            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
            table.add_row(Row::new(vec![
                Cell::new("Name").style_spec("b"),
                Cell::new("Installed").style_spec("b"),
                Cell::new("Available").style_spec("b"),
                Cell::new("Verified").style_spec("b"),
                Cell::new("Service").style_spec("b"),
            ]));
            for entry in &installed {
                let available = manager
                    .formulary()
                    .lookup(&entry.record.name)
                    .map(|f| f.version.clone())
                    .unwrap_or_else(|_| "-".to_string());
                let newer = available != "-" && available != entry.record.version;
                let service = entry
                    .service
                    .as_ref()
                    .map(|s| colored_state(s.state).to_string())
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(Row::new(vec![
                    Cell::new(&entry.record.name).style_spec("Fb"),
                    Cell::new(&entry.record.version),
                    Cell::new(&available).style_spec(if newer { "Fy" } else { "" }),
                    Cell::new(if entry.record.verified { "✔" } else { "✖" }),
                    Cell::new(&service),
                ]));
            }
            table.printstd();
            println!("{}", format!("{} formulas installed", installed.len()).bold());
        }

        if self.available {
            let names: Vec<&str> = manager
                .formulary()
                .list()
                .into_iter()
                .filter(|n| !installed.iter().any(|e| e.record.name == *n))
                .collect();
            if !names.is_empty() {
                println!();
                println!("{}", "Available:".bold());
                for name in names {
                    println!("    {name}");
                }
            }
        }
        Ok(())
    }
}
