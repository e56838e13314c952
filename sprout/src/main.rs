// sprout/src/main.rs
use std::fs;
use std::process;

use clap::Parser;
use colored::Colorize;
use sprout_common::config::Config;
use sprout_common::error::Result as SproutResult;
use sprout_common::formulary::Formulary;
use sprout_core::PackageManager;
use sprout_net::DefaultFetcher;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{CliArgs, Command};

fn init_logging(config: &Config, verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::WARN);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("SPROUT_LOG")
        .from_env_lossy();

    let log_dir = config.logs_dir();
    if verbose == 0 {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Warning:".yellow().bold(),
            log_dir.display(),
            e
        );
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, "sprout.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
    let stderr_writer = std::io::stderr.with_max_level(max_log_level);
    let file_writer = non_blocking_appender.with_max_level(max_log_level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr_writer.and(file_writer))
        .with_ansi(true)
        .without_time()
        .try_init();

    // The appender flushes on drop; keep it for the life of the process.
    Box::leak(Box::new(guard));
    debug!(
        "Verbose logging enabled. Writing logs to: {}/sprout.log",
        log_dir.display()
    );
}

async fn run(cli_args: CliArgs) -> SproutResult<()> {
    let mut config = Config::load()?;
    if cli_args.strict {
        config.strict_checksums = true;
    }
    init_logging(&config, cli_args.verbose);

    let formulary = Formulary::load(&config)?;
    debug!(
        "Loaded {} formula(s) from {}",
        formulary.len(),
        config.formula_dir().display()
    );
    let manager = PackageManager::new(config, formulary, DefaultFetcher::new()?)?;

    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    if !matches!(cli_args.command, Command::Supervise(_)) {
        manager.reattach(false).await?;
    }
    cli_args.command.run(&manager).await
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::parse();

    if let Err(e) = run(cli_args).await {
        error!("Command failed during {}: {:#}", e.stage(), e);
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        process::exit(e.exit_code());
    }
    debug!("Command completed successfully.");
}
