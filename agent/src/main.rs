use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rotary_agent::commands;
use rotary_config::ConfigStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rotary-agent", version, about)]
pub struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(
        long,
        short,
        global = true,
        env = "ROTARY_CONFIG_PATH",
        default_value = "rotary.toml"
    )]
    config_path: PathBuf,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the activation scheduler until interrupted
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show every identity with its quota usage
    Status,
}

fn init_tracing(level: &str) {
    let fallback = format!("rotary_agent={level},rotary_db={level},rotary_config={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .pretty()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store = ConfigStore::load(&args.config_path).with_context(|| {
        format!("Failed to load config from {}", args.config_path.display())
    })?;

    init_tracing(&store.config().log_level);

    match args.command {
        Command::Run { once } => commands::run::run(store, once).await,
        Command::Status => commands::status::status(&store),
    }
}
