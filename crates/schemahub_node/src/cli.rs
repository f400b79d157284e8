use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "schemahub", about = "Coinbase trade feed ingestion and curation pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest recent trades, resuming from per-product checkpoints.
    Ingest {
        /// Product id, e.g. BTC-USD. Without it the seed file drives the run.
        product: Option<String>,
        /// Start from the smallest legal cursor instead of the checkpoint.
        #[arg(long)]
        full_refresh: bool,
        /// Concurrent product workers.
        #[arg(long)]
        workers: Option<usize>,
        /// Trades per upstream page request.
        #[arg(long)]
        limit: Option<u64>,
        /// Resolve targets and cursors without fetching or writing.
        #[arg(long)]
        dry_run: bool,
        /// Seed file path.
        #[arg(long)]
        seed_path: Option<PathBuf>,
    },
    /// Backfill history for every seeded product in its own checkpoint
    /// namespace.
    Backfill {
        /// Concurrent product workers.
        #[arg(long)]
        workers: Option<usize>,
        /// Trades per upstream page request.
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Resume from backfill checkpoints instead of restarting.
        #[arg(long)]
        resume: bool,
        /// Seed file path.
        #[arg(long)]
        seed_path: Option<PathBuf>,
        /// Resolve targets and cursors without fetching or writing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Transform accumulated raw pages into the unified columnar dataset.
    Transform {
        /// Re-transform every raw file, ignoring the manifest.
        #[arg(long)]
        rebuild: bool,
        /// Also run the full-dataset validation after the transform.
        #[arg(long)]
        full_scan: bool,
    },
    /// Refresh the product seed file from the exchange catalog.
    UpdateSeed {
        /// Seed file path.
        #[arg(long)]
        path: Option<PathBuf>,
        /// Merge fetched ids with the existing seed instead of replacing it.
        #[arg(long)]
        merge: bool,
        /// Keep only product ids matching this regex, e.g. '.*-USD'.
        #[arg(long)]
        filter_regex: Option<String>,
        /// Print what would be written without writing it.
        #[arg(long)]
        dry_run: bool,
    },
}
