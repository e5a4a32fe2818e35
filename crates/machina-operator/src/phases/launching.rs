//! Launching phase: wait for the kubelet to join
//!
//! The controller cannot make the kubelet register; it can only observe.
//! Once real status conditions appear, drop the not-up taint and move to
//! running.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use machina_common::{NodePhase, Result};

use crate::controller::Context;
use crate::meta;

/// Advance to running once the kubelet has reported status
pub async fn handle(_ctx: &Arc<Context>, mut node: Node) -> Result<Option<Node>> {
    if !meta::has_joined(&node) {
        return Ok(None);
    }

    info!(node = %meta::name(&node), "kubelet joined, node is running");
    meta::remove_not_up_taint(&mut node);
    meta::set_phase(&mut node, NodePhase::Running);
    Ok(Some(node))
}
