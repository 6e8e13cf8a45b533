//! `leasehold` command-line caller.
//!
//! # Responsibility
//! - Acquire, renew, release and inspect leases on a shared SQLite lock file.
//! - Print results as JSON on stdout; diagnostics go to stderr.
//!
//! Exit codes: 0 success, 2 resource locked (retry later), 1 any other failure.

use clap::{Parser, Subcommand};
use leasehold_core::{
    default_log_level, init_stderr_logging, open_db_with_options, CancelToken, LeaseLockStore,
    LockError, SqliteLockTable, StoreOptions,
};
use log::debug;
use serde_json::json;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use uuid::Uuid;

const MIN_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// Lease-based distributed locks over a shared SQLite file
#[derive(Parser, Debug)]
#[command(name = "leasehold")]
#[command(version)]
struct Cli {
    /// Path to the shared lock database
    #[arg(long, env = "LEASEHOLD_DB", default_value = "leasehold.db")]
    db: PathBuf,

    /// Path to a JSON options file
    #[arg(short, long, env = "LEASEHOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level written to stderr (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim or renew the lease on a resource
    Acquire {
        resource_id: String,
        /// Lease length in milliseconds (defaults to the configured lease)
        #[arg(long)]
        lease_ms: Option<u64>,
        /// Lock id from a previous acquire, to renew instead of claim
        #[arg(long)]
        lock_id: Option<Uuid>,
        /// Keep retrying a locked resource for up to this many milliseconds
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },
    /// Release a lease held under `lock_id`
    Release { resource_id: String, lock_id: Uuid },
    /// Show the current valid lease on a resource
    Inspect { resource_id: String },
    /// Delete expired lock rows
    Purge,
    /// Check the binary and library are wired up
    Ping,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            let retryable = err
                .downcast_ref::<LockError>()
                .is_some_and(LockError::is_retryable);
            if retryable {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let options = match &cli.config {
        Some(path) => StoreOptions::load(path)?,
        None => StoreOptions::default(),
    };
    let level = cli
        .log_level
        .as_deref()
        .or(options.log_level.as_deref())
        .unwrap_or(default_log_level())
        .to_string();
    init_stderr_logging(&level)?;

    if let Command::Ping = cli.command {
        print_json(&json!({
            "ping": leasehold_core::ping(),
            "version": leasehold_core::core_version(),
        }))?;
        return Ok(());
    }

    let conn = open_db_with_options(&cli.db, &options)?;
    let table = SqliteLockTable::for_locks(&conn)?;
    let store = LeaseLockStore::with_options(table, options);
    let cancel = CancelToken::new();

    match cli.command {
        Command::Acquire {
            resource_id,
            lease_ms,
            lock_id,
            wait_ms,
        } => {
            let lease = lease_ms.map(Duration::from_millis);
            let deadline = Instant::now() + Duration::from_millis(wait_ms);
            let lock = loop {
                match store.acquire(&resource_id, lease, lock_id, &cancel) {
                    Ok(lock) => break lock,
                    Err(err) if err.is_retryable() && Instant::now() < deadline => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let sleep = match &err {
                            LockError::ResourceLocked {
                                recommended_wait, ..
                            } => (*recommended_wait).max(MIN_RETRY_SLEEP),
                            _ => MIN_RETRY_SLEEP,
                        }
                        .min(remaining);
                        debug!(
                            "event=cli_retry module=cli resource_id={} sleep_ms={}",
                            resource_id,
                            sleep.as_millis()
                        );
                        std::thread::sleep(sleep);
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            print_json(&serde_json::to_value(&lock)?)?;
        }
        Command::Release {
            resource_id,
            lock_id,
        } => {
            store.release(&resource_id, lock_id, &cancel)?;
            print_json(&json!({ "resource_id": resource_id, "released": true }))?;
        }
        Command::Inspect { resource_id } => {
            let lock = store.inspect(&resource_id, &cancel)?;
            print_json(&serde_json::to_value(&lock)?)?;
        }
        Command::Purge => {
            let removed = store.purge_expired(&cancel)?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Ping => {}
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
