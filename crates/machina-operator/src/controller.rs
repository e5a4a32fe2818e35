//! Reconcile loop: key dispatch, diff-patch persistence, retry policy

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use tracing::{debug, error, info, instrument, warn};

use machina_backend::MachineBackend;
use machina_common::crd::NodeClass;
use machina_common::{metrics, Error, NodePhase, Result};

use crate::cache::ObjectCache;
use crate::meta;
use crate::migrate::MigrationTracker;
use crate::phases;
use crate::queue::WorkQueue;

/// Retry ceiling per key; beyond it the key is dropped until the next
/// external update
pub const MAX_SYNC_RETRIES: u32 = 5;

/// Requeue delay after a pass that made no forward step
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Write access to Node objects
///
/// Mutations go through this seam so tests can capture patches. 404s are
/// swallowed: patching or deleting an object that is already gone is a
/// successful no-op.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Apply a JSON Patch to a node
    async fn patch_node(&self, name: &str, patch: &json_patch::Patch) -> Result<()>;

    /// Delete a node
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// `NodeApi` over the real cluster
pub struct KubeNodeApi {
    api: Api<Node>,
}

impl KubeNodeApi {
    /// Wrap a cluster-scoped Node API
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeApi for KubeNodeApi {
    async fn patch_node(&self, name: &str, patch: &json_patch::Patch) -> Result<()> {
        let params = PatchParams::default();
        match self
            .api
            .patch(name, &params, &Patch::Json::<()>(patch.clone()))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = name, "patch target gone, nothing to do");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state for the reconcile loop and the periodic workers
pub struct Context {
    /// Node cache fed by the watch
    pub nodes: Arc<dyn ObjectCache<Node>>,
    /// NodeClass cache fed by the watch
    pub classes: Arc<dyn ObjectCache<NodeClass>>,
    /// Write access to nodes
    pub api: Arc<dyn NodeApi>,
    /// Machine backend
    pub backend: Arc<dyn MachineBackend>,
    /// Work queue of node names
    pub queue: Arc<WorkQueue>,
    /// In-flight migration bookkeeping
    pub migrations: MigrationTracker,
    /// How long the deleting path waits for a sibling before hard removal
    pub max_migration_wait: Duration,
}

/// Compute the minimal patch from `original` to `updated` and write it;
/// returns whether a write happened. An empty diff is skipped entirely.
pub async fn patch_diff(
    api: &dyn NodeApi,
    name: &str,
    original: &serde_json::Value,
    updated: &Node,
) -> Result<bool> {
    let target = serde_json::to_value(updated)
        .map_err(|e| Error::serialization_for_kind("Node", e.to_string()))?;
    let patch = json_patch::diff(original, &target);
    if patch.0.is_empty() {
        debug!(node = name, "no changes, skipping patch");
        return Ok(false);
    }
    debug!(node = name, ops = patch.0.len(), "patching node");
    api.patch_node(name, &patch).await?;
    Ok(true)
}

/// One reconcile pass over a node
#[instrument(skip(ctx), fields(node = key))]
pub async fn sync_node(ctx: &Arc<Context>, key: &str) -> Result<()> {
    let Some(node) = ctx.nodes.get(key) else {
        debug!("node no longer in cache");
        return Ok(());
    };
    if !meta::is_owned(&node) {
        return Ok(());
    }

    let original = serde_json::to_value(&*node)
        .map_err(|e| Error::serialization_for_kind("Node", e.to_string()))?;
    let mut working = (*node).clone();

    let phase = NodePhase::of(&working);
    if phase != NodePhase::Deleting {
        // Normalize the stored annotation; unknown values become pending
        meta::set_phase(&mut working, phase);
    }

    let timer = metrics::SyncTimer::start(phase);
    let outcome = phases::dispatch(ctx, phase, working).await;
    timer.observe();

    match outcome? {
        Some(updated) => {
            patch_diff(ctx.api.as_ref(), key, &original, &updated).await?;
            Ok(())
        }
        None => {
            // Nothing to persist; poll again so external progress (machine
            // boot, kubelet join) is eventually observed
            ctx.queue.add_after(key, POLL_INTERVAL);
            Ok(())
        }
    }
}

/// Apply the retry policy to a sync outcome
pub async fn handle_outcome(ctx: &Arc<Context>, key: &str, outcome: Result<()>) {
    match outcome {
        Ok(()) => ctx.queue.forget(key).await,
        Err(err) => {
            metrics::record_sync_error();
            let attempts = ctx.queue.num_requeues(key).await;
            if err.is_retryable() && attempts < MAX_SYNC_RETRIES {
                warn!(node = key, attempts, error = %err, "sync failed, requeueing");
                ctx.queue.add_rate_limited(key).await;
            } else {
                error!(node = key, attempts, error = %err, "sync failed, dropping key");
                ctx.queue.forget(key).await;
            }
        }
    }
}

/// Worker loop: pull keys until the queue shuts down
pub async fn run_worker(ctx: Arc<Context>) {
    while let Some(key) = ctx.queue.get().await {
        let outcome = sync_node(&ctx, &key).await;
        handle_outcome(&ctx, &key, outcome).await;
        ctx.queue.done(&key).await;
    }
    info!("worker stopped");
}
