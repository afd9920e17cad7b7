use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::journaling::OwnerRef;

pub mod commands;

use self::commands::{DeleteArgs, ListArgs, ShowArgs, WriteArgs};

#[derive(Parser, Debug)]
#[command(name = "diary", version, about = "Journal entries with debounced autosave")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over DIARY_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over DIARY_DATA)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Owner to write entries as (overrides account.owner)
    #[arg(long, global = true)]
    pub owner: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an entry from stdin, autosaving as lines arrive
    Write(WriteArgs),
    /// List your entries, newest first
    List(ListArgs),
    /// Print a single entry
    Show(ShowArgs),
    /// Delete an entry
    Delete(DeleteArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let loader = ConfigLoader::discover()?;
    let config = loader.load_or_init()?;

    let owner = cli
        .owner
        .as_deref()
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(OwnerRef::new)
        .or_else(|| config.account.owner_ref());

    match cli.command {
        Commands::Write(args) => commands::write_entry(&config, owner, args),
        Commands::List(args) => commands::list_entries(&config, owner, args),
        Commands::Show(args) => commands::show_entry(&config, args),
        Commands::Delete(args) => commands::delete_entry(&config, args),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
