//! Machina operator: drives Node objects through their machine lifecycle

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::ResourceExt;
use tracing::{error, info, warn};

use machina_backend::DriverRegistry;
use machina_common::crd::NodeClass;
use machina_common::telemetry::{init_telemetry, TelemetryConfig};
use machina_common::{metrics, CONTROLLER_NAME};

mod cache;
mod condition;
mod controller;
mod meta;
mod migrate;
mod phases;
mod queue;
mod resolver;
mod server;
#[cfg(test)]
mod testutil;

use cache::StoreCache;
use controller::{Context, KubeNodeApi};
use migrate::MigrationTracker;
use queue::WorkQueue;

/// How often the node-count gauge is refreshed from the cache
const NODE_COUNT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "machina-operator", about = "Node lifecycle controller")]
struct Args {
    /// Listen address for the health endpoint
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_listen_address: std::net::SocketAddr,

    /// Listen address for the Prometheus metrics endpoint
    #[arg(long, default_value = "0.0.0.0:8082")]
    metrics_listen_address: std::net::SocketAddr,

    /// How long a deleting node waits for a migrated sibling before its
    /// machine is destroyed
    #[arg(long, default_value_t = 20)]
    max_migration_wait_seconds: u64,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = 25)]
    workers: usize,

    /// Full-cache requeue interval
    #[arg(long, default_value_t = 300)]
    resync_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let registry = init_telemetry(TelemetryConfig {
        service_name: "machina-operator".to_string(),
    })?;

    info!(controller = CONTROLLER_NAME, ?args, "starting operator");
    let client = kube::Client::try_default().await?;

    let queue = WorkQueue::new();

    // Node watch: mirror into the cache and enqueue every touched name
    let (node_store, node_writer) = reflector::store::<Node>();
    {
        let api: Api<Node> = Api::all(client.clone());
        let watch = watcher(api, watcher::Config::default()).default_backoff();
        let stream = reflector(node_writer, watch).touched_objects();
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(node) => queue.add(&node.name_any()).await,
                    Err(err) => warn!(error = %err, "node watch error"),
                }
            }
        });
    }

    // NodeClass watch: cache only, nothing to enqueue
    let (class_store, class_writer) = reflector::store::<NodeClass>();
    {
        let api: Api<NodeClass> = Api::all(client.clone());
        let watch = watcher(api, watcher::Config::default()).default_backoff();
        let stream = reflector(class_writer, watch).touched_objects();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(event) = stream.next().await {
                if let Err(err) = event {
                    warn!(error = %err, "node class watch error");
                }
            }
        });
    }

    let nodes: Arc<StoreCache<Node>> = Arc::new(StoreCache::new(node_store));
    let classes: Arc<StoreCache<NodeClass>> = Arc::new(StoreCache::new(class_store));

    // Drivers register here at startup; an empty registry still runs the
    // controller for already-provisioned nodes
    let backend = DriverRegistry::new();
    info!(providers = ?backend.providers(), "machine backend ready");

    let ctx = Arc::new(Context {
        nodes: nodes.clone(),
        classes: classes.clone(),
        api: Arc::new(KubeNodeApi::new(client)),
        backend: Arc::new(backend),
        queue: Arc::clone(&queue),
        migrations: MigrationTracker::new(),
        max_migration_wait: Duration::from_secs(args.max_migration_wait_seconds),
    });

    spawn_server(
        args.health_listen_address,
        server::health_router(server::HealthState {
            nodes: nodes.clone(),
            classes,
        }),
    );
    spawn_server(args.metrics_listen_address, server::metrics_router(registry));

    for _ in 0..args.workers {
        tokio::spawn(controller::run_worker(Arc::clone(&ctx)));
    }
    tokio::spawn(condition::run_ready_condition_worker(Arc::clone(&ctx)));
    tokio::spawn(migrate::run_sweeper(Arc::clone(&ctx)));
    tokio::spawn(node_count_loop(Arc::clone(&ctx)));
    tokio::spawn(resync_loop(
        Arc::clone(&ctx),
        Duration::from_secs(args.resync_seconds),
    ));

    shutdown_signal().await;
    info!("shutting down");
    queue.shut_down().await;
    if !ctx.migrations.drain(ctx.max_migration_wait).await {
        warn!("timed out waiting for in-flight migrations");
    }
    Ok(())
}

fn spawn_server(addr: std::net::SocketAddr, app: axum::Router) {
    tokio::spawn(async move {
        if let Err(err) = server::serve(addr, app).await {
            error!(%addr, error = %err, "http server failed");
        }
    });
}

/// Keep the managed-node gauge current
async fn node_count_loop(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(NODE_COUNT_INTERVAL);
    loop {
        ticker.tick().await;
        let count = ctx.nodes.list().iter().filter(|n| meta::is_owned(n)).count();
        metrics::set_node_count(count as i64);
    }
}

/// Periodically requeue every owned node so drift is reconciled even
/// without watch events
async fn resync_loop(ctx: Arc<Context>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await; // the watch's initial list covers the first round
    loop {
        ticker.tick().await;
        for node in ctx.nodes.list() {
            if meta::is_owned(&node) {
                ctx.queue.add(meta::name(&node)).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
