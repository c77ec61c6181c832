// SPDX-License-Identifier: MIT

//! `calog` CLI: open an engine against a log directory and drive it from
//! the command line, generalizing `hdds-persistence`'s `main.rs` (top-level
//! flags + `clap::Subcommand`) from a DDS persistence service to this
//! logging engine.
//!
//! # Usage
//!
//! ```bash
//! # Run the engine, exit on Ctrl-C
//! calog --logpath ./data
//!
//! # Inspect what's on disk
//! calog --logpath ./data stats
//! calog --logpath ./data fetch 42
//! calog --logpath ./data scan --reverse
//!
//! # Smoke-test throughput
//! calog --logpath ./data bench --threads 4 --records 1000
//! ```

use anyhow::{Context, Result};
use calog::config::Config;
use calog::index::BlockIndex;
use calog::logger::Logger;
use calog::record::{Arg, RecordType};
use calog::scan::ScanIterator;
use calog::system::System;
use calog::txn::TransactionContext;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "calog")]
#[command(about = "Per-object redo logging engine", long_about = None)]
struct Args {
    /// Directory holding log files and the block index.
    #[arg(long, default_value = ".")]
    logpath: PathBuf,

    /// Wipe existing log files and the block index on start.
    #[arg(long)]
    format: bool,

    /// Enable old-file recycling.
    #[arg(long)]
    log_recycle: bool,

    /// Per-file cap, in mebibytes.
    #[arg(long, default_value_t = 1024)]
    log_file_size_mib: u64,

    /// Recycling threshold; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    log_max_files: usize,

    /// Block-index file name or path.
    #[arg(long, default_value = "index.db")]
    log_index_path: String,

    /// Number of consolidation-array slots.
    #[arg(long, default_value_t = 3)]
    active_slots: usize,

    /// Group-commit watchdog timeout, in milliseconds.
    #[arg(long, default_value_t = 10)]
    watchdog_timeout_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print block-index row count, hardened epoch, and file counts.
    Stats,
    /// Replay every record for one object, oldest first.
    Fetch {
        /// Object id to fetch.
        object_id: u64,
        /// Walk newest-first instead of oldest-first.
        #[arg(long)]
        reverse: bool,
    },
    /// Dump every record across every indexed block.
    Scan {
        /// Walk newest-first instead of oldest-first.
        #[arg(long)]
        reverse: bool,
    },
    /// Spin up N threads, each committing M records, and report throughput.
    Bench {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 1000)]
        records: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = Config::builder(args.logpath.clone())
        .format(args.format)
        .log_recycle(args.log_recycle)
        .log_file_size(args.log_file_size_mib * 1024 * 1024)
        .log_max_files(args.log_max_files)
        .log_index_path(args.log_index_path.clone())
        .active_slots(args.active_slots)
        .watchdog_timeout_ms(args.watchdog_timeout_ms)
        .build()
        .context("invalid configuration")?;

    let system = Arc::new(System::open(config).context("failed to open engine")?);

    let result = match args.command {
        Some(Commands::Stats) => cmd_stats(&system),
        Some(Commands::Fetch { object_id, reverse }) => cmd_fetch(&system, object_id, !reverse),
        Some(Commands::Scan { reverse }) => cmd_scan(&system, !reverse),
        Some(Commands::Bench { threads, records }) => cmd_bench(&system, threads, records),
        None => run_until_signal(&args.logpath),
    };

    system.shutdown();
    result
}

fn cmd_stats(system: &Arc<System>) -> Result<()> {
    let blocks = system.index().fetch_blocks(true).context("failed to query block index")?;
    println!("blocks indexed:  {}", blocks.len());
    println!("hardened epoch:  {}", system.flusher().hardened_epoch());
    let files: std::collections::BTreeSet<u64> = blocks.iter().map(|b| b.file).collect();
    println!("log files:       {}", files.len());
    Ok(())
}

fn cmd_fetch(system: &Arc<System>, object_id: u64, forward: bool) -> Result<()> {
    let iter = ScanIterator::fetch(system.log().clone(), system.index().as_ref(), object_id, forward)
        .context("failed to start fetch")?;
    let mut count = 0usize;
    for record in iter {
        println!(
            "seq={} type={:?} len={}",
            record.header.seq_num(),
            record.header.record_type(),
            record.header.length()
        );
        count += 1;
    }
    println!("{count} record(s)");
    Ok(())
}

fn cmd_scan(system: &Arc<System>, forward: bool) -> Result<()> {
    let iter = ScanIterator::scan(system.log().clone(), system.index().as_ref(), Box::new(|_| true), forward)
        .context("failed to start scan")?;
    let mut count = 0usize;
    for record in iter {
        println!(
            "object_id={} seq={} type={:?} len={}",
            record.header.object_id(),
            record.header.seq_num(),
            record.header.record_type(),
            record.header.length()
        );
        count += 1;
    }
    println!("{count} record(s)");
    Ok(())
}

fn cmd_bench(system: &Arc<System>, threads: usize, records: usize) -> Result<()> {
    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let system = system.clone();
            std::thread::spawn(move || -> Result<Vec<Duration>> {
                let mut local = Vec::with_capacity(records);
                let mut logger = Logger::new();
                let mut ctx = TransactionContext::begin(system).context("begin failed")?;
                logger.initialize(false).context("initialize failed")?;
                for i in 0..records {
                    let t0 = Instant::now();
                    logger
                        .log(RecordType::Insert, &[Arg::U64(i as u64)])
                        .context("log failed")?;
                    local.push(t0.elapsed());
                }
                ctx.commit();
                Ok(local)
            })
        })
        .collect();

    let mut latencies: Vec<Duration> = Vec::new();
    for handle in handles {
        latencies.extend(handle.join().expect("bench thread panicked")?);
    }
    latencies.sort();

    let total = threads * records;
    let elapsed = start.elapsed();
    let p50 = latencies.get(latencies.len() / 2).copied().unwrap_or_default();
    let p99 = latencies.get(latencies.len() * 99 / 100).copied().unwrap_or_default();
    println!("committed {total} records across {threads} thread(s) in {elapsed:?}");
    println!("throughput: {:.0} records/sec", total as f64 / elapsed.as_secs_f64());
    println!("per-record log latency: p50={p50:?} p99={p99:?}");
    Ok(())
}

fn run_until_signal(logpath: &std::path::Path) -> Result<()> {
    tracing::info!(?logpath, "engine running, press Ctrl-C to stop");
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    Ok(())
}
