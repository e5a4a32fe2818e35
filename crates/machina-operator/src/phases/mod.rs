//! Phase handlers
//!
//! One module per lifecycle phase. Handlers take the working copy and
//! return `Some(updated)` when there is a change to persist, `None` when
//! the pass made no forward step and the node should be polled again.
//! Each call performs at most one forward step; the patch it produces
//! re-enqueues the node for the next step.

pub mod deleting;
pub mod launching;
pub mod pending;
pub mod provisioning;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;

use machina_common::{NodePhase, Result};

use crate::controller::Context;

/// Route a node to its phase handler
pub async fn dispatch(
    ctx: &Arc<Context>,
    phase: NodePhase,
    node: Node,
) -> Result<Option<Node>> {
    match phase {
        NodePhase::Pending => pending::handle(ctx, node).await,
        NodePhase::Provisioning => provisioning::handle(ctx, node).await,
        NodePhase::Launching => launching::handle(ctx, node).await,
        // Steady state: return the copy unchanged so an empty diff ends
        // the pass without a write or a requeue
        NodePhase::Running => Ok(Some(node)),
        NodePhase::Deleting => deleting::handle(ctx, node).await,
    }
}
