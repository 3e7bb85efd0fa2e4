//! kvdb - command-line front end
//!
//! Each invocation opens the store, runs one operation and exits. Results go
//! to stdout, logs to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvdb::record::format_timestamp;
use kvdb::{Config, KvError, Source, Store};

#[derive(Debug, Parser)]
#[command(name = "kvdb", version, about = "Multi-process key-value store")]
struct Cli {
    /// Directory holding the storage log (overrides KVDB_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Directory holding the shared cache segment (overrides KVDB_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a value under a key
    Set { key: String, value: String },
    /// Print the value stored under a key
    Get { key: String },
    /// Remove a key
    #[command(alias = "delete")]
    Del { key: String },
    /// Print when a key was first and last set
    Ts { key: String },
    /// Print shared cache statistics as JSON
    Stats,
    /// Empty the shared cache (the log is kept)
    Reset,
    /// Print every record in the log
    Dump,
}

fn main() -> ExitCode {
    // Defaults to warnings only, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvdb=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<KvError>() {
                Some(KvError::KeyNotFound(_)) => println!("Key not found"),
                _ => eprintln!("Error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    let mut store = Store::open(config).context("failed to open store")?;

    match cli.command {
        Command::Set { key, value } => {
            store.set(&key, &value)?;
            println!("OK");
        }
        Command::Get { key } => {
            let found = store.get(&key)?;
            println!("{}", found.value);
        }
        Command::Del { key } => {
            if store.delete(&key)? {
                println!("Deleted {}", key);
            } else {
                println!("Key not found");
            }
        }
        Command::Ts { key } => {
            let found = store.timestamps(&key)?;
            let tag = match found.source {
                Source::Cache => " (cached)",
                Source::Log => "",
            };
            println!("First set{}: {}", tag, format_timestamp(&found.value.first_set));
            println!("Last set{}: {}", tag, format_timestamp(&found.value.last_set));
        }
        Command::Stats => {
            let stats = store.cache_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reset => {
            store.reset_cache()?;
            println!("Cache reset");
        }
        Command::Dump => {
            for record in store.dump()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.key,
                    record.value,
                    format_timestamp(&record.first_set),
                    format_timestamp(&record.last_set)
                );
            }
        }
    }
    Ok(())
}
