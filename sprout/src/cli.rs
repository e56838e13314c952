// sprout/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use sprout_common::error::{Result, SproutError};
use sprout_core::PackageManager;
use sprout_net::DefaultFetcher;

pub mod info;
pub mod install;
pub mod list;
pub mod service;
pub mod supervise;
pub mod uninstall;
pub mod upgrade;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::service::ServiceArgs;
use crate::cli::supervise::Supervise;
use crate::cli::test::TestArgs;
use crate::cli::uninstall::Uninstall;
use crate::cli::upgrade::UpgradeArgs;

pub type Manager = PackageManager<DefaultFetcher>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "sprout", bin_name = "sprout")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Refuse artifacts that have no checksum to verify against
    #[arg(long, global = true)]
    pub strict: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Install(InstallArgs),
    Upgrade(UpgradeArgs),
    Uninstall(Uninstall),
    Service(ServiceArgs),
    List(List),
    Info(Info),
    Test(TestArgs),
    Supervise(Supervise),
}

impl Command {
    pub async fn run(&self, manager: &Manager) -> Result<()> {
        match self {
            Self::Install(command) => command.run(manager).await,
            Self::Upgrade(command) => command.run(manager).await,
            Self::Uninstall(command) => command.run(manager).await,
            Self::Service(command) => command.run(manager).await,
            Self::List(command) => command.run(manager).await,
            Self::Info(command) => command.run(manager).await,
            Self::Test(command) => command.run(manager).await,
            Self::Supervise(command) => command.run(manager).await,
        }
    }
}

pub(crate) fn ohai(message: impl AsRef<str>) {
    println!("{}{}", "==> ".bold().blue(), message.as_ref().bold());
}

/// Prints every per-name failure, then returns the first so its exit code is used.
pub(crate) fn finish(errors: Vec<(String, SproutError)>) -> Result<()> {
    for (name, err) in &errors {
        eprintln!("{} {}: {}", "✖".red().bold(), name.cyan(), err);
    }
    match errors.into_iter().next() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn version_string_is_name_and_crate_version() {
        let rendered = CliArgs::command().render_version().to_string();
        assert_eq!(rendered.trim(), format!("sprout {}", env!("CARGO_PKG_VERSION")));
        assert_eq!(rendered.trim(), "sprout 0.1.0");

        let err = CliArgs::try_parse_from(["sprout", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn service_subcommands_parse() {
        let args = CliArgs::try_parse_from(["sprout", "-vv", "service", "restart", "x"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Command::Service(_)));

        let args = CliArgs::try_parse_from(["sprout", "install", "--strict", "a", "b"]).unwrap();
        assert!(args.strict);
        match args.command {
            Command::Install(install) => assert_eq!(install.names, vec!["a", "b"]),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(CliArgs::try_parse_from(["sprout", "install"]).is_err());
        assert!(CliArgs::try_parse_from(["sprout", "service", "pause", "x"]).is_err());
    }

    #[test]
    fn first_failure_decides_the_exit_code() {
        let errors = vec![
            ("a".to_string(), SproutError::NotFound("a".into())),
            ("b".to_string(), SproutError::install_failed("b", "disk full")),
        ];
        let err = finish(errors).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(finish(Vec::new()).is_ok());
    }
}
