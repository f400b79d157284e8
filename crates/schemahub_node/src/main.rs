use clap::Parser;
use schemahub_ingest::controller::{RunStatus, RunSummary};
use schemahub_node::cli::{Cli, Command};
use schemahub_node::config::NodeConfig;
use schemahub_node::runner::{register_all_metrics, resolve_products, NodeError, NodeResult, Pipeline};
use schemahub_node::trace_util;
use schemahub_storage::checkpoint::CheckpointMode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use validator::Validate;

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    trace_util::configure_tracing();
    register_all_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation signal received; finishing the in-flight batch.");
            signal_cancel.cancel();
        }
    });

    match dispatch(cli, cancel).await {
        Ok(RunStatus::Success) => 0,
        Ok(_) => 1,
        Err(NodeError::Usage(message)) => {
            eprintln!("{message}");
            2
        }
        Err(NodeError::Runtime(runtime_error)) => {
            error!(error = %runtime_error, "Run failed.");
            eprintln!("Error: {runtime_error:#}");
            1
        }
    }
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> NodeResult<RunStatus> {
    match cli.command {
        Command::Ingest { product, full_refresh, workers, limit, dry_run, seed_path } => {
            let config = node_config()?;
            let products = resolve_products(product, seed_path.as_deref())?;

            let mut ingest_config = config.ingest.clone();
            if let Some(workers) = workers {
                ingest_config.product_workers = workers;
            }
            if let Some(limit) = limit {
                ingest_config.page_limit = limit;
                ingest_config.cache_batch_size = ingest_config.cache_batch_size.max(limit);
            }
            ingest_config.dry_run = dry_run;
            ingest_config.resume_from_checkpoint = !full_refresh;
            ingest_config
                .validate()
                .map_err(|invalid| NodeError::Usage(invalid.to_string()))?;
            let mode =
                if full_refresh { CheckpointMode::FullRefresh } else { CheckpointMode::Ingest };

            let pipeline = Pipeline::from_config(config, cancel)?;
            let result = pipeline.run_ingest(mode, products, ingest_config).await;
            pipeline.shutdown().await;
            let summary = result?;
            emit_summary(&summary)?;
            Ok(summary.status)
        }
        Command::Backfill { workers, chunk_size, resume, seed_path, dry_run } => {
            let config = node_config()?;
            let products = resolve_products(None, seed_path.as_deref())?;

            let mut ingest_config = config.ingest.clone();
            if let Some(workers) = workers {
                ingest_config.product_workers = workers;
            }
            if let Some(chunk_size) = chunk_size {
                ingest_config.page_limit = chunk_size;
                ingest_config.cache_batch_size = ingest_config.cache_batch_size.max(chunk_size);
            }
            ingest_config.dry_run = dry_run;
            ingest_config.resume_from_checkpoint = resume;
            ingest_config
                .validate()
                .map_err(|invalid| NodeError::Usage(invalid.to_string()))?;

            let pipeline = Pipeline::from_config(config, cancel)?;
            let result =
                pipeline.run_ingest(CheckpointMode::Backfill, products, ingest_config).await;
            pipeline.shutdown().await;
            let summary = result?;
            emit_summary(&summary)?;
            Ok(summary.status)
        }
        Command::Transform { rebuild, full_scan } => {
            let config = node_config()?;
            let pipeline = Pipeline::from_config(config, cancel)?;
            let result = pipeline.run_transform(rebuild, full_scan).await;
            pipeline.shutdown().await;
            let report = result?;
            emit_summary(&report.summary)?;
            Ok(report.summary.status)
        }
        Command::UpdateSeed { path, merge, filter_regex, dry_run } => {
            let config = NodeConfig::from_env()
                .unwrap_or_else(|_| NodeConfig::from_env_with_bucket(String::new()));
            let pipeline = Pipeline::from_config(config, cancel)?;
            let seed = pipeline
                .run_update_seed(path.as_deref(), merge, filter_regex.as_deref(), dry_run)
                .await?;
            if dry_run {
                println!("Would write {} product ids", seed.products.len());
                for product in seed.products.iter().take(200) {
                    println!("{product}");
                }
                if seed.products.len() > 200 {
                    println!("... (truncated)");
                }
            } else {
                println!("Wrote {} product ids", seed.products.len());
            }
            Ok(RunStatus::Success)
        }
    }
}

fn node_config() -> NodeResult<NodeConfig> {
    NodeConfig::from_env().map_err(|config_error| NodeError::Usage(config_error.to_string()))
}

/// The operator contract: exactly one JSON line on stdout at termination.
fn emit_summary(summary: &RunSummary) -> NodeResult<()> {
    let line = serde_json::to_string(summary)
        .map_err(|serialize_error| NodeError::Runtime(serialize_error.into()))?;
    println!("{line}");
    Ok(())
}
