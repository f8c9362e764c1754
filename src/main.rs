//! Binary entrypoint for the chatcast CLI.
//!
//! Commands:
//! - `run` - load the configuration and run the scheduler loop
//! - `init` - write a default configuration file
//!
//! Credentials for the wire adapters come from the environment
//! (`DISCORD_BOT_TOKEN`, `DISCORD_CHANNEL_ID`, `MISSKEY_INSTANCE`,
//! `MISSKEY_TOKEN`); the config file only selects the platform and tuning.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use chatcast::build_runtime;
use chatcast::config::Config;

#[derive(Parser)]
#[command(name = "chatcast")]
#[command(about = "Dispatch core for a multi-platform posting bot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and dispatch loop until interrupted
    Run,
    /// Write a default configuration file
    Init,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("wrote default configuration to {}", cli.config);
            Ok(())
        }
        Commands::Run => {
            let config = Config::load(&cli.config).await?;
            let mut runtime = build_runtime(&config, None)?;
            info!(
                "chatcast dispatching to {} (channel {})",
                runtime.platform,
                runtime.default_channel.as_deref().unwrap_or("-")
            );
            let shutdown = runtime.scheduler.shutdown_handle();
            let orchestrator = std::sync::Arc::clone(&runtime.orchestrator);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                    orchestrator.close().await;
                }
            });
            runtime.scheduler.run_forever().await;
            if let Err(err) = runtime
                .orchestrator
                .flush(std::time::Duration::from_secs(10))
                .await
            {
                error!("final flush failed: {err}");
            }
            runtime.orchestrator.close().await;
            Ok(())
        }
    }
}
