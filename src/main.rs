//! carpark-bucket-diff
//!
//! `create-list` lists the CAR files of an origin bucket, derives the
//! carpark key each one should have, and writes a deduplicated NDJSON
//! manifest that is then published. `update-list` checks a manifest
//! against the destination bucket and keeps the entries it is missing.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | ORIGIN_BUCKET_* | required | Source bucket (create-list) |
//! | DESTINATION_BUCKET_* | required | Carpark bucket (update-list) |
//! | READ_BATCH_SIZE | required | Keys per listing page |
//! | WRITE_BATCH_SIZE | required | Entries per shard |
//! | PREFIX | none | Listing prefix |
//! | CONTINUATION_TOKEN | none | Resume after this key |
//! | RESUME | false | Keep existing shards and continue numbering |
//! | PUBLISH_ONLY | false | Merge existing shards and publish, no listing |
//! | OUTPUT_DIR | . | Shards and manifest location |
//! | MANIFEST_PATH | required | Manifest to check (update-list) |
//! | PUBLISH_TARGET | web3 | web3, local or none |
//! | WEB3_STORAGE_TOKEN | web3 | API token |
//! | METRICS_PORT | 8000 | `/metrics` port, 0 disables |
//! | RUST_LOG | info | Log filter |
//! | LOG_FORMAT | text | `json` for structured logs |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use carpark_bucket_diff::config::{CreateListConfig, PublishTarget, UpdateListConfig};
use carpark_bucket_diff::metrics::{MetricsServer, PipelineMetrics};
use carpark_bucket_diff::observability::{init_tracing, LogFormat};
use carpark_bucket_diff::pipeline::{PipelineConfig, PipelineRunner, RunReport};
use carpark_bucket_diff::publish::{Publisher, StorePublisher};
use carpark_bucket_diff::store::LocalFsObjectStore;
use carpark_bucket_diff::update::UpdateListRunner;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(
    name = "carpark-bucket-diff",
    version,
    about = "Diff an origin bucket against carpark-keyed storage"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List origin CARs with their carpark keys and publish the manifest
    CreateList(CreateListArgs),
    /// Keep the manifest entries the destination bucket does not have
    UpdateList(UpdateListArgs),
}

#[derive(clap::Args, Debug)]
struct CreateListArgs {
    /// Write shards only; skip merge and publish
    #[arg(long, conflicts_with = "publish_only")]
    list_only: bool,
    /// Keep the shards of a failed run and continue numbering after them
    #[arg(long)]
    resume: bool,
    /// Merge the shards already on disk and publish, without listing
    #[arg(long)]
    publish_only: bool,
}

#[derive(clap::Args, Debug)]
struct UpdateListArgs {
    /// Manifest to check (overrides MANIFEST_PATH)
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing(LogFormat::from_env());
    let cli = Cli::parse();

    match cli.cmd {
        Command::CreateList(args) => create_list(args).await,
        Command::UpdateList(args) => update_list(args).await,
    }
}

async fn start_metrics(
    port: u16,
    metrics: &Arc<PipelineMetrics>,
) -> std::io::Result<Option<JoinHandle<()>>> {
    if port == 0 {
        return Ok(None);
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = MetricsServer::bind(addr, Arc::clone(metrics)).await?;
    Ok(Some(server.spawn()))
}

fn publisher_for(target: &PublishTarget) -> Result<Option<Box<dyn Publisher>>, BoxError> {
    match target {
        #[cfg(feature = "web3")]
        PublishTarget::Web3 { token, endpoint } => Ok(Some(Box::new(
            carpark_bucket_diff::publish::Web3StoragePublisher::new(endpoint.clone(), token.clone())?,
        ))),
        #[cfg(not(feature = "web3"))]
        PublishTarget::Web3 { .. } => Err("built without the web3 feature".into()),
        PublishTarget::Local { dir } => Ok(Some(Box::new(StorePublisher::new(
            LocalFsObjectStore::new(dir.clone()),
        )))),
        PublishTarget::None => Ok(None),
    }
}

async fn create_list(args: CreateListArgs) -> Result<(), BoxError> {
    let mut config = CreateListConfig::from_env()?;
    config.resume |= args.resume;
    config.publish_only |= args.publish_only;
    info!(
        bucket = %config.origin.name,
        prefix = ?config.prefix,
        output = %config.output_dir.display(),
        resume = config.resume,
        publish_only = config.publish_only,
        "create-list"
    );

    let metrics = PipelineMetrics::new();
    let metrics_task = start_metrics(config.metrics_port, &metrics).await?;
    let publisher = publisher_for(&config.publish)?;
    let origin = config.origin.open(config.retry.policy())?;

    let runner = PipelineRunner::new(PipelineConfig::from_create_list(&config), origin)
        .with_metrics(Arc::clone(&metrics));

    let result = if config.publish_only {
        runner
            .publish_existing(publisher.as_deref())
            .await
            .map(|report| print_run(&report))
    } else if args.list_only {
        runner.list_and_shard().await.map(|listed| {
            println!(
                "{} shard(s) in {}",
                listed.shards_written,
                runner.config().shard_dir.display()
            );
        })
    } else {
        runner
            .run(publisher.as_deref())
            .await
            .map(|report| print_run(&report))
    };

    if let Some(task) = metrics_task {
        task.abort();
    }
    Ok(result?)
}

fn print_run(report: &RunReport) {
    println!("manifest: {}", report.merged.manifest.display());
    if let Some(cid) = &report.cid {
        println!("cid: {}", cid);
    }
}

async fn update_list(args: UpdateListArgs) -> Result<(), BoxError> {
    let manifest = args.manifest.map(|p| p.to_string_lossy().into_owned());
    let config = UpdateListConfig::from_lookup(|name| match (name, &manifest) {
        ("MANIFEST_PATH", Some(path)) => Some(path.clone()),
        _ => std::env::var(name).ok(),
    })?;
    info!(
        bucket = %config.destination.name,
        manifest = %config.manifest_path.display(),
        "update-list"
    );

    let metrics = PipelineMetrics::new();
    let metrics_task = start_metrics(config.metrics_port, &metrics).await?;
    let destination = config.destination.open(config.retry.policy())?;

    let runner = UpdateListRunner::new(destination).with_metrics(Arc::clone(&metrics));
    let result = runner
        .run(&config.manifest_path, &config.missing_path())
        .await;

    if let Some(task) = metrics_task {
        task.abort();
    }
    let report = result?;
    println!(
        "{} of {} missing, written to {}",
        report.missing,
        report.checked,
        report.output.display()
    );
    Ok(())
}
