// sprout/src/cli/service.rs
use clap::{Args, Subcommand};
use colored::Colorize;
use sprout_common::error::Result;
use sprout_core::{ServiceState, ServiceStatus};

use crate::cli::Manager;

#[derive(Args, Debug)]
pub struct ServiceArgs {
    #[command(subcommand)]
    pub action: ServiceAction,
}

#[derive(Subcommand, Debug)]
pub enum ServiceAction {
    /// Launch the service (no-op if it is already running)
    Start { name: String },
    /// Terminate the service, escalating to SIGKILL after the grace period
    Stop { name: String },
    /// Stop then start the service
    Restart { name: String },
    /// Show the service state
    Status { name: String },
}

impl ServiceArgs {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        let (name, status) = match &self.action {
            ServiceAction::Start { name } => (name, manager.service_start(name).await?),
            ServiceAction::Stop { name } => (name, manager.service_stop(name).await?),
            ServiceAction::Restart { name } => (name, manager.service_restart(name).await?),
            ServiceAction::Status { name } => (name, manager.service_status(name).await?),
        };
        print_status(name, &status);
        Ok(())
    }
}

pub(crate) fn colored_state(state: ServiceState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        ServiceState::Running => text.green(),
        ServiceState::Crashed => text.red(),
        ServiceState::Stopped => text.yellow(),
        ServiceState::Unregistered => text.dimmed(),
    }
}

fn print_status(name: &str, status: &ServiceStatus) {
    let pid = status
        .pid
        .map(|p| format!(" (pid {p})"))
        .unwrap_or_default();
    println!("{}: {}{}", name.cyan(), colored_state(status.state), pid);
    if status.restarts > 0 {
        println!("    restarts: {}", status.restarts);
    }
    if let Some(last) = &status.last_exit {
        println!("    last exit: {last}");
    }
}
