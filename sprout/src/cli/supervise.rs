// sprout/src/cli/supervise.rs
use clap::Args;
use colored::Colorize;
use sprout_common::error::Result;

use crate::cli::service::colored_state;
use crate::cli::{ohai, Manager};

/// Stay in the foreground and keep installed services alive until interrupted.
#[derive(Args, Debug)]
pub struct Supervise;

impl Supervise {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        ohai("Supervising installed services (Ctrl-C to detach)");
        let attached = manager.supervise().await?;
        if attached.is_empty() {
            println!("{}", "No installed services".yellow());
            return Ok(());
        }
        for (name, status) in attached {
            let current = manager.supervisor().status(&name).await;
            let state = if current.pid.is_some() { current.state } else { status.state };
            println!(
                "    {} {} (restarts: {})",
                name.cyan(),
                colored_state(state),
                current.restarts.max(status.restarts)
            );
        }
        println!("Detached; running services keep running.");
        Ok(())
    }
}
