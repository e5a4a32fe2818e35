//! Deleting phase: migration watch or backend teardown
//!
//! A deletion is not always the end of the machine: when a provisioned
//! kubelet registers itself it gets a fresh Node object, and the right
//! move is to hand the machine's identity to that sibling instead of
//! destroying it. The bounded watch and the teardown both run off-worker;
//! this handler only decides and spawns.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use machina_common::{Result, DRIVER_DATA_ANNOTATION_KEY};

use crate::controller::Context;
use crate::meta;
use crate::migrate;

/// One deleting step
///
/// Releases the finalizer immediately: as long as the terminating object
/// holds it, the name stays taken and a kubelet re-registration under the
/// same name cannot appear. The sibling watch runs off-worker on an
/// in-memory copy taken before the strip.
pub async fn handle(ctx: &Arc<Context>, mut node: Node) -> Result<Option<Node>> {
    let name = meta::name(&node).to_string();

    // Without our finalizer there is nothing left to guard; let the API
    // server finish the delete
    if !meta::has_finalizer(&node) {
        return Ok(None);
    }

    // No machine behind this node: just release the finalizer
    if meta::annotation(&node, DRIVER_DATA_ANNOTATION_KEY).is_none() {
        meta::remove_finalizer(&mut node);
        return Ok(Some(node));
    }

    // One watcher per node; re-syncs while it runs are no-ops
    if !ctx.migrations.begin(&name).await {
        return Ok(None);
    }

    info!(node = %name, "node deleting, watching for a migrated sibling");
    let snapshot = node.clone();
    let ctx_task = Arc::clone(ctx);
    tokio::spawn(async move {
        migrate::run_deletion(ctx_task, snapshot).await;
    });

    meta::remove_finalizer(&mut node);
    Ok(Some(node))
}
