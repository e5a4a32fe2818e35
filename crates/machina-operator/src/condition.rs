//! Synthetic Ready condition for nodes still being provisioned
//!
//! Cluster services garbage-collect NotReady nodes; a node whose kubelet
//! has not started yet would be reaped mid-provisioning. Until the node is
//! running, the controller asserts a Ready=True condition under its own
//! reason. It never touches a condition a kubelet has written, and a
//! condition it already wrote is left alone so repeated passes stay
//! write-free.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::warn;

use machina_common::NodePhase;

use crate::controller::{patch_diff, Context};
use crate::meta;

/// Reason marking conditions as controller-written
pub const READY_REASON: &str = "AwaitingProvisioning";

const READY_MESSAGE: &str =
    "Node is being provisioned by machina; Ready is asserted to suppress garbage collection";

/// How often the patcher scans the cache
pub const PATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Compute the Ready-condition update for one node, if any is needed
///
/// Returns `None` when the condition is already in the desired state or is
/// owned by a kubelet.
pub fn ensure_ready_condition(node: &Node, now: Time) -> Option<Node> {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    if let Some(existing) = conditions.iter().find(|c| c.type_ == "Ready") {
        if existing.reason.as_deref() != Some(READY_REASON) {
            // A kubelet (or someone else) owns this condition
            return None;
        }
        if existing.status == "True" && existing.message.as_deref() == Some(READY_MESSAGE) {
            // Already as desired; timestamps are deliberately not refreshed
            return None;
        }
    }

    let desired = NodeCondition {
        type_: "Ready".to_string(),
        status: "True".to_string(),
        reason: Some(READY_REASON.to_string()),
        message: Some(READY_MESSAGE.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
    };

    let mut updated = node.clone();
    let status = updated.status.get_or_insert_with(NodeStatus::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    match conditions.iter_mut().find(|c| c.type_ == "Ready") {
        Some(slot) => *slot = desired,
        None => conditions.push(desired),
    }
    Some(updated)
}

/// One pass: assert the condition on every cached node that is not running
///
/// The pass deliberately covers foreign registrations too; the
/// never-overwrite guard in `ensure_ready_condition` is what protects
/// kubelet-written conditions.
pub async fn patch_ready_conditions(ctx: &Arc<Context>) {
    let now = Time(k8s_openapi::chrono::Utc::now());
    for node in ctx.nodes.list() {
        if NodePhase::of(&node) == NodePhase::Running {
            continue;
        }
        let Some(updated) = ensure_ready_condition(&node, now.clone()) else {
            continue;
        };

        let name = meta::name(&node).to_string();
        let original = match serde_json::to_value(&*node) {
            Ok(v) => v,
            Err(err) => {
                warn!(node = %name, error = %err, "failed to serialize node");
                continue;
            }
        };
        if let Err(err) = patch_diff(ctx.api.as_ref(), &name, &original, &updated).await {
            warn!(node = %name, error = %err, "failed to patch ready condition");
        }
    }
}

/// Periodic patcher loop
pub async fn run_ready_condition_worker(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(PATCH_INTERVAL);
    loop {
        ticker.tick().await;
        patch_ready_conditions(&ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockNodeApi;
    use crate::testutil::*;
    use machina_common::PHASE_ANNOTATION_KEY;

    fn now() -> Time {
        Time(k8s_openapi::chrono::Utc::now())
    }

    fn with_ready(mut node: Node, status: &str, reason: &str, message: Option<&str>) -> Node {
        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: status.to_string(),
                reason: Some(reason.to_string()),
                message: message.map(str::to_string),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    /// Story: a bare node gets the synthetic condition appended
    #[test]
    fn story_condition_is_added_when_absent() {
        let node = owned_node("node-a");
        let updated = ensure_ready_condition(&node, now()).unwrap();
        let cond = &updated.status.unwrap().conditions.unwrap()[0];
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason.as_deref(), Some(READY_REASON));
    }

    /// Story: a second pass over a patched node is a no-op
    ///
    /// The write-free steady state is what keeps the 5s loop from
    /// generating patch traffic for every pending node forever.
    #[test]
    fn story_repeated_passes_are_write_free() {
        let node = owned_node("node-a");
        let patched = ensure_ready_condition(&node, now()).unwrap();
        assert!(ensure_ready_condition(&patched, now()).is_none());
    }

    /// Story: kubelet-written conditions are never overwritten
    #[test]
    fn story_kubelet_conditions_are_respected() {
        let node = with_ready(owned_node("node-a"), "False", "KubeletNotReady", None);
        assert!(ensure_ready_condition(&node, now()).is_none());
    }

    /// Story: a drifted controller-written condition is repaired
    #[test]
    fn story_own_condition_is_repaired_on_drift() {
        let node = with_ready(owned_node("node-a"), "Unknown", READY_REASON, None);
        let updated = ensure_ready_condition(&node, now()).unwrap();
        let conds = updated.status.unwrap().conditions.unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, "True");
    }

    /// Story: the pass skips only running nodes
    ///
    /// Bare foreign registrations are covered too; conditions a kubelet
    /// has already written are the reason guard's job.
    #[tokio::test]
    async fn story_pass_skips_only_running_nodes() {
        let pending = owned_node("pending-a");

        let mut running = owned_node("running-a");
        meta::set_annotation(&mut running, PHASE_ANNOTATION_KEY, "running");

        // Foreign node with a kubelet-owned condition: left alone
        let kubelet = with_ready(node_named("kubelet-a"), "False", "KubeletNotReady", None);

        // Bare foreign registration: gets the synthetic condition
        let foreign = node_named("foreign-a");

        let mut api = MockNodeApi::new();
        api.expect_patch_node()
            .withf(|name, _| name == "pending-a" || name == "foreign-a")
            .times(2)
            .returning(|_, _| Ok(()));

        let harness = Harness::with_api(
            vec![pending, running, kubelet, foreign],
            vec![],
            Arc::new(api),
        );
        patch_ready_conditions(&harness.ctx).await;
    }
}
