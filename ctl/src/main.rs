use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rotary_config::ConfigStore;
use rotary_db::storage::{IdentityCatalog, ProgressLedger};
use tracing_subscriber::EnvFilter;

use crate::commands::{GenerateParams, RemoveParams, SetParams};

mod commands;

#[derive(Parser)]
#[command(name = "rotaryctl", version, about)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short = 'C',
        long,
        global = true,
        env = "ROTARY_CONFIG_PATH",
        default_value = "rotary.toml"
    )]
    config_path: PathBuf,
}

#[derive(Clone, Subcommand)]
pub enum Command {
    /// Append freshly generated identities to the catalog
    Generate(GenerateParams),

    /// List every identity in the catalog
    List,

    /// Remove one identity
    Remove(RemoveParams),

    /// Remove every identity
    Clear,

    /// Give every identity a new virtual machine code
    #[command(name = "regenerate-codes")]
    RegenerateCodes,

    /// Show activation counts per machine code
    Ledger,

    /// Inspect or change the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and list every problem
    Check,

    /// Change one option and save the file
    Set(SetParams),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rotaryctl=warn,rotary_db=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut store = ConfigStore::load(&args.config_path).with_context(|| {
        format!("Failed to load config from {}", args.config_path.display())
    })?;

    let config = store.snapshot();
    let open_catalog = || {
        IdentityCatalog::open(config.catalog_path()).context("Failed to open identity catalog")
    };
    let open_ledger =
        || ProgressLedger::open(config.ledger_path()).context("Failed to open progress ledger");

    match args.command {
        Command::Generate(params) => commands::generate(&open_catalog()?, params),
        Command::List => commands::list(&open_catalog()?, &open_ledger()?),
        Command::Remove(params) => commands::remove(&open_catalog()?, params),
        Command::Clear => commands::clear(&open_catalog()?),
        Command::RegenerateCodes => commands::regenerate_codes(&open_catalog()?),
        Command::Ledger => commands::ledger(&open_ledger()?),
        Command::Config(ConfigCommand::Check) => commands::check_config(&store),
        Command::Config(ConfigCommand::Set(params)) => commands::set_config(&mut store, params),
    }
}
