//! FrozenDB CLI - inspect and drive a FrozenDB file from the shell
//!
//! This binary provides operator-facing commands for FrozenDB:
//! - Create a new database file
//! - Append a single-row transaction
//! - Look up a key
//! - Run the offline verifier
//! - Print transaction boundaries around a physical row

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use frozendb::{CreateConfig, FileMode, FinderKind, FrozenDb, HostFsOps};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "frozendb-cli")]
#[command(about = "Inspect and drive a FrozenDB file")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new database file
    Create {
        path: PathBuf,
        #[arg(long, default_value_t = 512)]
        row_size: u32,
        #[arg(long, default_value_t = 5000)]
        skew_ms: u32,
    },
    /// Append one row as its own transaction
    Put {
        path: PathBuf,
        /// JSON value to store; the key is minted fresh (UUIDv7, now)
        value: String,
    },
    /// Look up a key's stored value
    Get {
        path: PathBuf,
        /// UUIDv7 key, hyphenated form
        key: String,
    },
    /// Run the offline two-pass verifier
    Verify { path: PathBuf },
    /// Print the transaction boundary containing a physical row index
    Boundary { path: PathBuf, physical_index: u64 },
}

fn parse_key(text: &str) -> Result<[u8; 16]> {
    let uuid = uuid::Uuid::parse_str(text).context("key is not a valid UUID")?;
    Ok(*uuid.as_bytes())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Create { path, row_size, skew_ms } => {
            let config = CreateConfig::new(path.clone(), row_size, skew_ms);
            let db = FrozenDb::create(&config, Arc::new(HostFsOps), FinderKind::InMemory)?;
            println!("created {} ({} bytes)", path.display(), db.size());
        }
        Commands::Put { path, value } => {
            let db = FrozenDb::open(&path, FileMode::Write, Arc::new(HostFsOps), FinderKind::InMemory)?;
            let parsed: serde_json::Value = serde_json::from_str(&value).context("value is not valid JSON")?;
            let key = frozendb::uuid7::generate_now();
            db.begin()?;
            db.add_row(key, parsed)?;
            db.commit()?;
            println!("{}", uuid::Uuid::from_bytes(key));
        }
        Commands::Get { path, key } => {
            let db = FrozenDb::open(&path, FileMode::Read, Arc::new(HostFsOps), FinderKind::Simple)?;
            let key = parse_key(&key)?;
            let value = db.get(&key)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Verify { path } => {
            let db = FrozenDb::open(&path, FileMode::Read, Arc::new(HostFsOps), FinderKind::Simple)?;
            let report = db.verify()?;
            println!(
                "ok: {} rows checked, {} checksum rows, trailing partial row: {}",
                report.rows_checked, report.checksum_rows_checked, report.ends_with_partial_row
            );
        }
        Commands::Boundary { path, physical_index } => {
            let db = FrozenDb::open(&path, FileMode::Read, Arc::new(HostFsOps), FinderKind::Simple)?;
            let start = db.get_transaction_start(physical_index)?;
            let end = db.get_transaction_end(physical_index)?;
            println!("transaction [{start}, {end}]");
        }
    }

    Ok(())
}
