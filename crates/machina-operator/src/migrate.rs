//! Machine-identity migration
//!
//! When a provisioned kubelet registers itself, the API server may hold two
//! Node objects for one machine: the controller-created one and the
//! kubelet's own registration (same name with a new UID, or a different
//! name carrying the same hostname label). The deleting path watches for
//! such a sibling and transfers the machine's identity to it instead of
//! destroying the machine; the periodic sweep deletes superseded
//! controller nodes so that watch actually triggers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use machina_common::{NodePhase, Result, DRIVER_DATA_ANNOTATION_KEY, MANAGED_ANNOTATION_KEYS};

use crate::controller::{patch_diff, Context};
use crate::meta;

/// How often the sibling watch re-scans the cache
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// How often the sweep looks for superseded nodes
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct TrackerInner {
    in_flight: HashSet<String>,
    claimed: HashMap<String, String>,
}

/// Bookkeeping for deletions in progress
///
/// `in_flight` prevents one node from getting two concurrent watches;
/// `claimed` maps a node name to the UID of the generation whose machine
/// was torn down, making teardown idempotent across reruns of the same
/// object while a later generation reusing the name claims fresh.
#[derive(Clone, Default)]
pub struct MigrationTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl MigrationTracker {
    /// New empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node's deletion as in flight; false if it already is
    pub async fn begin(&self, name: &str) -> bool {
        self.inner.lock().await.in_flight.insert(name.to_string())
    }

    /// Mark a node's deletion flow as finished
    pub async fn finish(&self, name: &str) {
        self.inner.lock().await.in_flight.remove(name);
    }

    /// Whether a deletion flow is currently running for the node
    pub async fn is_in_flight(&self, name: &str) -> bool {
        self.inner.lock().await.in_flight.contains(name)
    }

    /// Claim this generation's machine for teardown; false if the same
    /// generation already claimed it
    pub async fn claim_removal(&self, name: &str, uid: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.claimed.get(name).is_some_and(|c| c == uid) {
            return false;
        }
        inner.claimed.insert(name.to_string(), uid.to_string());
        true
    }

    /// Release a claim after a failed teardown so a retry can claim again
    pub async fn release_claim(&self, name: &str) {
        self.inner.lock().await.claimed.remove(name);
    }

    /// Wait until no deletion flows are in flight, bounded by `timeout`;
    /// returns whether everything drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.lock().await.in_flight.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WATCH_INTERVAL).await;
        }
    }
}

/// Find the foreign sibling of a node among the cached candidates
///
/// A sibling is not owned by this controller and has a different UID. Name
/// identity is checked across all candidates before hostname identity, so
/// an exact re-registration always wins over a hostname coincidence.
pub fn find_sibling(source: &Node, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
    let source_uid = meta::uid(source);
    let source_name = meta::name(source);

    let foreign = |c: &Arc<Node>| meta::uid(c) != source_uid && !meta::is_owned(c);

    if let Some(found) = candidates
        .iter()
        .find(|c| foreign(c) && meta::name(c) == source_name)
    {
        return Some(Arc::clone(found));
    }

    if let Some(hostname) = meta::hostname_label(source) {
        if let Some(found) = candidates
            .iter()
            .find(|c| foreign(c) && meta::hostname_label(c) == Some(hostname))
        {
            return Some(Arc::clone(found));
        }
    }

    None
}

/// Poll the cache for a sibling until `max_wait` elapses
async fn wait_for_sibling(
    ctx: &Arc<Context>,
    source: &Node,
    max_wait: Duration,
) -> Option<Arc<Node>> {
    let deadline = Instant::now() + max_wait;
    loop {
        if let Some(sibling) = find_sibling(source, &ctx.nodes.list()) {
            return Some(sibling);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}

/// Hand the source node's machine identity to the sibling
///
/// Copies the controller-managed annotations, claims the sibling, forces
/// its phase to running, and ensures the delete finalizer so the machine
/// stays guarded. The sibling's own labels and kubelet-reported state are
/// left untouched.
pub async fn transfer(ctx: &Arc<Context>, source: &Node, target: &Node) -> Result<()> {
    let target_name = meta::name(target).to_string();
    let original = serde_json::to_value(target).map_err(|e| {
        machina_common::Error::serialization_for_kind("Node", e.to_string())
    })?;
    let mut updated = target.clone();

    for key in MANAGED_ANNOTATION_KEYS {
        if let Some(value) = meta::annotation(source, key) {
            meta::set_annotation(&mut updated, key, value);
        }
    }
    meta::set_phase(&mut updated, NodePhase::Running);
    meta::set_owner_label(&mut updated);
    meta::add_finalizer(&mut updated);

    patch_diff(ctx.api.as_ref(), &target_name, &original, &updated).await?;
    Ok(())
}

/// Deletion flow for one node: bounded sibling watch, then either identity
/// transfer or backend teardown. The finalizer was already released by the
/// deleting handler; this flow runs on the in-memory copy taken before the
/// strip.
pub async fn run_deletion(ctx: Arc<Context>, node: Node) {
    let name = meta::name(&node).to_string();
    if let Err(err) = deletion_flow(&ctx, &node).await {
        error!(node = %name, error = %err, "deletion flow failed, will retry on next sync");
    }
    ctx.migrations.finish(&name).await;
}

async fn deletion_flow(ctx: &Arc<Context>, node: &Node) -> Result<()> {
    let name = meta::name(node).to_string();

    match wait_for_sibling(ctx, node, ctx.max_migration_wait).await {
        Some(sibling) => {
            info!(
                source = %name,
                target = %meta::name(&sibling),
                "sibling registered, migrating machine identity"
            );
            transfer(ctx, node, &sibling).await?;
        }
        None => {
            if ctx.migrations.claim_removal(&name, meta::uid(node)).await {
                info!(node = %name, "no sibling appeared, removing machine");
                if let Err(err) = remove_machine(ctx, node).await {
                    // Let a rerun for this same object claim again
                    ctx.migrations.release_claim(&name).await;
                    return Err(err);
                }
            } else {
                // A previous run for this same object already tore the
                // machine down
                info!(node = %name, "machine already removed");
            }
        }
    }
    Ok(())
}

async fn remove_machine(ctx: &Arc<Context>, node: &Node) -> Result<()> {
    let Some(driver_data) = meta::annotation(node, DRIVER_DATA_ANNOTATION_KEY) else {
        return Ok(());
    };
    let mut handle = ctx.backend.load(driver_data).await?;
    handle.remove().await
}

/// One sweep pass: delete owned nodes that a foreign sibling has superseded
///
/// Deleting the owned node is what arms the bounded watch, which then
/// performs the actual transfer.
pub async fn sweep_once(ctx: &Arc<Context>) {
    let nodes = ctx.nodes.list();
    for node in &nodes {
        if !meta::is_owned(node) || node.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(sibling) = find_sibling(node, &nodes) else {
            continue;
        };

        let (Some(own_created), Some(sib_created)) = (
            node.metadata.creation_timestamp.as_ref(),
            sibling.metadata.creation_timestamp.as_ref(),
        ) else {
            continue;
        };
        // Only the older node is superseded; a younger owned node would be
        // a fresh replacement the sibling predates
        if own_created.0 >= sib_created.0 {
            continue;
        }

        let name = meta::name(node);
        info!(
            node = %name,
            sibling = %meta::name(&sibling),
            "foreign sibling registered, deleting superseded node"
        );
        if let Err(err) = ctx.api.delete_node(name).await {
            warn!(node = %name, error = %err, "failed to delete superseded node");
        }
    }
}

/// Periodic sweep loop
pub async fn run_sweeper(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        sweep_once(&ctx).await;
    }
}
