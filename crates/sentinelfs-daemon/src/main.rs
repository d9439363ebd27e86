//! SentinelFS - user-intent file-system event correlator
//!
//! A thin command-line front end around `sentinelfs_system::Core`: it
//! watches a directory tree and prints one JSON line per high-level
//! event (`Created`/`Deleted`/`Moved`/`Modified*`/`Copied`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinelfs_daemon::config::ConfigManager;
use sentinelfs_daemon::{Daemon, DaemonConfig};

/// SentinelFS - a user-intent file-system event correlator.
#[derive(Parser)]
#[command(name = "sentinelfs")]
#[command(about = "Watches a directory and emits high-level, deduplicated file events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watching and print released events as JSON lines
    Start(StartArgs),
    /// Validate a configuration file
    Validate(ValidateArgs),
    /// Write a default configuration file
    InitConfig(ConfigArgs),
    /// Print daemon version information
    Status,
}

#[derive(Args)]
struct StartArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "sentinelfs.toml")]
    config: PathBuf,

    /// Directory to watch, overriding the config file's watch.root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = "sentinelfs.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for the generated config
    #[arg(short, long, default_value = "sentinelfs.toml")]
    output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::Validate(args) => validate(args).await,
        Commands::InitConfig(args) => init_config(args).await,
        Commands::Status => status().await,
    }
}

async fn start(args: StartArgs) -> Result<()> {
    init_tracing(args.debug)?;
    info!("starting sentinelfs v{}", env!("CARGO_PKG_VERSION"));

    let mut config_manager = ConfigManager::new();
    if args.config.exists() {
        config_manager
            .load_from_file(&args.config)
            .await
            .with_context(|| "failed to load configuration")?;
    } else {
        warn!("configuration file not found, using defaults");
    }

    let mut config = config_manager.get_config().await;
    if let Some(root) = args.root {
        config.watch.root = root;
    }
    ConfigManager::validate(&config)?;

    if args.config.exists() {
        config_manager.start_hot_reload().await?;
    }

    let daemon = Daemon::new(config_manager).await?;
    daemon.run().await
}

async fn validate(args: ValidateArgs) -> Result<()> {
    info!("validating configuration: {}", args.config.display());
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config).await?;
    let config = config_manager.get_config().await;
    ConfigManager::validate(&config)?;
    println!("configuration is valid");
    Ok(())
}

async fn init_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "configuration file already exists: {}",
            args.output.display()
        );
    }

    let config_manager = ConfigManager::new();
    config_manager.save_to_file(&args.output).await?;
    info!("generated configuration file: {}", args.output.display());
    Ok(())
}

async fn status() -> Result<()> {
    println!("sentinelfs {}", env!("CARGO_PKG_VERSION"));
    let defaults = DaemonConfig::default();
    println!(
        "defaults: quiet_period={}s copy_group_expiry={}s empty_file_grace={}s",
        defaults.tunables.quiet_period_secs,
        defaults.tunables.copy_group_expiry_secs,
        defaults.tunables.empty_file_grace_secs,
    );
    Ok(())
}

fn init_tracing(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
