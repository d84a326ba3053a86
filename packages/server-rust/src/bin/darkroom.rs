//! Runs an in-process darkroom factory until Ctrl-C.
//!
//! Every setting is a flag with an environment fallback:
//!
//! ```bash
//! DARKROOM_WORKERS_PER_OP=2 darkroom --ops thumbnail,blur --metrics-addr 127.0.0.1:9100
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use darkroom_core::{Operation, TransformSet};
use darkroom_server::telemetry::{init_tracing, install_prometheus, LogFormat};
use darkroom_server::{
    DarkroomConfig, DeliveryPolicy, Factory, KvWorkerRegistry, LocalTransport, MemoryKvStore,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "darkroom", about = "Image transform factory", version)]
struct Args {
    /// Namespace scoping mailboxes and registry keys.
    #[arg(long, env = "DARKROOM_NAMESPACE", default_value = "imgsvc")]
    namespace: String,

    /// Operations dispatched for every upload.
    #[arg(
        long,
        env = "DARKROOM_OPS",
        value_delimiter = ',',
        default_value = "thumbnail,grayscale,blur,rotate90"
    )]
    ops: Vec<String>,

    /// Per-operation dispatch deadline, in milliseconds.
    #[arg(long, env = "DARKROOM_DISPATCH_TIMEOUT_MS", default_value_t = 10_000)]
    dispatch_timeout_ms: u64,

    /// Uploads dispatched concurrently.
    #[arg(long, env = "DARKROOM_MAX_CONCURRENT_UPLOADS", default_value_t = 64)]
    max_concurrent_uploads: usize,

    #[arg(long, env = "DARKROOM_DELIVERY", value_enum, default_value_t = DeliveryPolicy::One)]
    delivery: DeliveryPolicy,

    /// Workers started per operation at boot.
    #[arg(long, env = "DARKROOM_WORKERS_PER_OP", default_value_t = 1)]
    workers_per_op: usize,

    /// How long shutdown waits for in-flight outcome reports, in milliseconds.
    #[arg(long, env = "DARKROOM_DRAIN_TIMEOUT_MS", default_value_t = 30_000)]
    drain_timeout_ms: u64,

    #[arg(long, env = "DARKROOM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "DARKROOM_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn config(&self) -> DarkroomConfig {
        DarkroomConfig {
            namespace: self.namespace.clone(),
            operations: self.ops.iter().map(|op| Operation::new(op.trim())).collect(),
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
            max_concurrent_uploads: self.max_concurrent_uploads,
            delivery_policy: self.delivery,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            workers_per_operation: self.workers_per_op,
            ..DarkroomConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;
    if let Some(addr) = args.metrics_addr {
        install_prometheus(addr).context("starting metrics exporter")?;
    }

    let config = args.config();
    let transport = Arc::new(LocalTransport::new(config.namespace.clone()));
    let registry = Arc::new(KvWorkerRegistry::new(
        Arc::new(MemoryKvStore::new()),
        config.namespace.clone(),
    ));
    let handle = Factory::start(config, transport, registry, TransformSet::builtins()).await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    let snapshot = handle.shutdown().await?;
    info!(
        uploads = snapshot.metrics.total_uploads,
        variants = snapshot.metrics.total_variants,
        failed = snapshot.metrics.failed_variants,
        "final snapshot"
    );
    println!("{}", snapshot.to_json()?);
    Ok(())
}
