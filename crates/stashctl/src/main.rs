//! Stash operator CLI

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::commands::Operator;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache directory
    #[arg(short, long, env = "STASH_PATH", default_value = "./stash")]
    path: PathBuf,

    /// Values larger than this many bytes are stored as files
    #[arg(short, long, default_value_t = stashcache::DEFAULT_INLINE_THRESHOLD)]
    threshold: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show item count, total size and placement policy
    Info,

    /// Show metadata for keys without reading their values
    Inspect {
        /// Keys to inspect
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Write a stored value to stdout or a file
    Get {
        /// Key to read
        key: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a value
    Put {
        /// Key to write
        key: String,

        /// Literal value
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        value: Option<String>,

        /// Read the value from this file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Extended data stored beside the value
        #[arg(short, long)]
        extended: Option<String>,
    },

    /// Remove keys
    Remove {
        /// Keys to remove
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Evict items until the given limits hold
    Trim {
        /// Maximum number of items
        #[arg(long)]
        count: Option<u64>,

        /// Maximum total size in bytes
        #[arg(long)]
        cost: Option<u64>,

        /// Remove items written more than this many seconds ago
        #[arg(long)]
        age: Option<u64>,

        /// Evict until the volume has this many bytes free
        #[arg(long)]
        free_space: Option<u64>,
    },

    /// Remove orphan value files and rows whose file is gone
    Reconcile,

    /// Remove every item
    Clear {
        /// Remove in batches and report progress on stderr
        #[arg(long)]
        progress: bool,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();
    info!("Opening {} (inline threshold {})", args.path.display(), args.threshold);
    let operator = Operator::open(&args.path, args.threshold)?;

    let output = match args.command {
        Command::Info => operator.info()?,
        Command::Inspect { keys } => operator.inspect(&keys)?,
        Command::Get { key, output } => {
            operator.get(&key, output.as_deref())?;
            return Ok(());
        }
        Command::Put {
            key,
            value,
            file,
            extended,
        } => {
            let bytes = match (value, file) {
                (Some(value), _) => value.into_bytes(),
                (None, Some(file)) => std::fs::read(file)?,
                (None, None) => anyhow::bail!("put needs --value or --file"),
            };
            operator.put(&key, bytes, extended.map(String::into_bytes))?
        }
        Command::Remove { keys } => operator.remove(&keys)?,
        Command::Trim {
            count,
            cost,
            age,
            free_space,
        } => operator.trim(commands::TrimTargets {
            count,
            cost,
            age,
            free_space,
        })?,
        Command::Reconcile => operator.reconcile()?,
        Command::Clear { progress } => operator.clear(progress)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
