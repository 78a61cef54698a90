use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sysprop::config::{
    DEFAULT_BUILD_PROP_PATH, DEFAULT_PERSIST_DIR, ENV_DEFAULTS, ENV_PERSIST_DIR, ENV_WAIT,
};
use sysprop::{PropertyStore, StoreConfig, WaitMode};
use tracing::debug;

#[derive(Parser)]
#[command(name = "sysprop")]
#[command(about = "Read and write system properties.", long_about = None)]
struct Cli {
    /// Build-time defaults, `KEY=VALUE` per line
    #[arg(long, env = ENV_DEFAULTS, default_value = DEFAULT_BUILD_PROP_PATH)]
    defaults: PathBuf,

    /// Directory holding `persist.` properties
    #[arg(long, env = ENV_PERSIST_DIR, default_value = DEFAULT_PERSIST_DIR)]
    persist_dir: PathBuf,

    /// Do not load the defaults file
    #[arg(long)]
    no_defaults: bool,

    /// Neither load nor write persistent properties
    #[arg(long)]
    no_persist: bool,

    /// How readers wait for writers: `queue` or `sleep`
    #[arg(long, env = ENV_WAIT, default_value = "queue", value_parser = parse_wait_mode)]
    wait: WaitMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value of a property
    Get {
        name: String,
        /// Printed when the property is not defined
        #[arg(default_value = "")]
        default: String,
    },
    /// Set a property; `persist.` properties are written to the persist dir
    Set { name: String, value: String },
    /// Print all properties in creation order
    List,
    /// Write the binary property area image to a file
    Dump { output: PathBuf },
}

fn parse_wait_mode(s: &str) -> Result<WaitMode, String> {
    WaitMode::parse(s).ok_or_else(|| format!("unknown wait mode {s:?}, expected queue or sleep"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::new().with_wait_mode(cli.wait);
    if !cli.no_defaults {
        config = config.with_defaults_path(&cli.defaults);
    }
    if !cli.no_persist {
        config = config.with_persist_dir(&cli.persist_dir);
    }
    debug!("store config: {config:?}");

    let store = PropertyStore::init(&config).context("initializing the property store")?;

    match cli.command {
        Command::Get { name, default } => {
            println!("{}", store.get(&name).unwrap_or(default));
        }
        Command::Set { name, value } => {
            store
                .set(&name, &value)
                .with_context(|| format!("setting {name}"))?;
        }
        Command::List => {
            store.list(|name, value| println!("[{name}]: [{value}]"));
        }
        Command::Dump { output } => {
            std::fs::write(&output, store.to_image())
                .with_context(|| format!("writing {}", output.display()))?;
        }
    }

    Ok(())
}
