//! Pending phase: taint, finalizer, machine creation, boot wait
//!
//! Ordered one-step-per-call: (1) not-up taint, (2) delete finalizer,
//! (3) create the machine and persist driver data, (4) record its public
//! IP and SSH hostname, (5) wait for the machine to report running, then
//! advance to provisioning.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use machina_backend::{merge_flags, HostDescriptor, MachineState};
use machina_common::{
    Error, NodePhase, Result, DRIVER_DATA_ANNOTATION_KEY, HOSTNAME_ANNOTATION_KEY,
    PUBLIC_IP_ANNOTATION_KEY,
};

use crate::controller::Context;
use crate::meta;
use crate::resolver::resolve_class;

/// One pending step
pub async fn handle(ctx: &Arc<Context>, mut node: Node) -> Result<Option<Node>> {
    let name = meta::name(&node).to_string();

    if meta::add_not_up_taint(&mut node) {
        info!(node = %name, "tainting node until kubelet joins");
        return Ok(Some(node));
    }

    if meta::add_finalizer(&mut node) {
        return Ok(Some(node));
    }

    let driver_data = match meta::annotation(&node, DRIVER_DATA_ANNOTATION_KEY) {
        None => return create_machine(ctx, node).await.map(Some),
        Some(data) => data.to_string(),
    };

    if meta::annotation(&node, PUBLIC_IP_ANNOTATION_KEY).is_none() {
        let handle = ctx.backend.load(&driver_data).await?;
        let ip = handle.ip().await?;
        let hostname = handle.ssh_hostname().await?;
        meta::set_annotation(&mut node, PUBLIC_IP_ANNOTATION_KEY, ip);
        meta::set_annotation(&mut node, HOSTNAME_ANNOTATION_KEY, hostname);
        return Ok(Some(node));
    }

    let handle = ctx.backend.load(&driver_data).await?;
    match handle.run_state().await? {
        MachineState::Running => {
            info!(node = %name, "machine is up, advancing to provisioning");
            meta::set_phase(&mut node, NodePhase::Provisioning);
            Ok(Some(node))
        }
        state => {
            tracing::debug!(node = %name, ?state, "machine not running yet");
            Ok(None)
        }
    }
}

/// Create the backing machine and persist its driver data
async fn create_machine(ctx: &Arc<Context>, mut node: Node) -> Result<Node> {
    let name = meta::name(&node).to_string();
    let spec = resolve_class(&node, ctx.classes.as_ref())?;

    let mut handle = ctx
        .backend
        .new_host(&spec.provider, HostDescriptor::for_node(&name))
        .await?;

    let flags = merge_flags(&handle.declared_flags(), &spec.flags)
        .map_err(|e| Error::config_for(&name, e.to_string()))?;
    handle.configure(&flags)?;

    info!(node = %name, provider = %spec.provider, "creating machine");
    if let Err(err) = handle.create().await {
        // Tear down whatever the driver managed to allocate; the retry will
        // start from a clean slate
        if let Err(cleanup) = handle.remove().await {
            warn!(node = %name, error = %cleanup, "cleanup after failed create also failed");
        }
        return Err(err);
    }

    meta::set_annotation(&mut node, DRIVER_DATA_ANNOTATION_KEY, handle.driver_data()?);
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use machina_common::CLASS_CONTENT_ANNOTATION_KEY;

    fn ready_node(name: &str, class: &str) -> Node {
        // A node past steps 1 and 2
        let mut node = owned_node_with_class(name, class);
        meta::add_not_up_taint(&mut node);
        meta::add_finalizer(&mut node);
        node
    }

    /// Story: creation happens exactly once
    ///
    /// Once driver data is on the node, another pending pass must not
    /// create a second machine even if earlier steps repeat.
    #[tokio::test]
    async fn story_driver_data_gates_machine_creation() {
        let harness = Harness::new(
            vec![ready_node("node-a", "gp-large")],
            vec![class_named("gp-large", "fake")],
        );

        let node = harness.node("node-a");
        let created = handle(&harness.ctx, node).await.unwrap().unwrap();
        assert!(meta::annotation(&created, DRIVER_DATA_ANNOTATION_KEY).is_some());
        assert_eq!(harness.backend.created_count(), 1);

        // Second pass with driver data present: next step is the IP, no
        // second create
        let after = handle(&harness.ctx, created).await.unwrap().unwrap();
        assert_eq!(harness.backend.created_count(), 1);
        assert!(meta::annotation(&after, PUBLIC_IP_ANNOTATION_KEY).is_some());
        assert!(meta::annotation(&after, HOSTNAME_ANNOTATION_KEY).is_some());
    }

    /// Story: a failed create tears the partial machine down
    #[tokio::test]
    async fn story_failed_create_removes_partial_machine() {
        let harness = Harness::new(
            vec![ready_node("node-a", "gp-large")],
            vec![class_named("gp-large", "fake")],
        );
        harness.backend.fail_next_create();

        let node = harness.node("node-a");
        let err = handle(&harness.ctx, node).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(harness.backend.removed(), vec!["node-a".to_string()]);
    }

    /// Story: the machine must report running before the phase advances
    #[tokio::test]
    async fn story_phase_advances_only_when_machine_runs() {
        let harness = Harness::new(
            vec![ready_node("node-a", "gp-large")],
            vec![class_named("gp-large", "fake")],
        );

        let node = harness.node("node-a");
        let node = handle(&harness.ctx, node).await.unwrap().unwrap(); // create
        let node = handle(&harness.ctx, node).await.unwrap().unwrap(); // ip

        harness.backend.set_run_state(MachineState::Starting);
        // Still booting: no change, caller polls again later
        assert!(handle(&harness.ctx, node.clone()).await.unwrap().is_none());

        harness.backend.set_run_state(MachineState::Running);
        let advanced = handle(&harness.ctx, node).await.unwrap().unwrap();
        assert_eq!(NodePhase::of(&advanced), NodePhase::Provisioning);
    }

    /// Story: embedded class content provisions without a class object
    #[tokio::test]
    async fn story_embedded_class_content_is_sufficient() {
        let mut node = owned_node("node-a");
        meta::add_not_up_taint(&mut node);
        meta::add_finalizer(&mut node);
        let spec = machina_common::crd::NodeClassSpec {
            provider: "fake".to_string(),
            ..Default::default()
        };
        meta::set_annotation(
            &mut node,
            CLASS_CONTENT_ANNOTATION_KEY,
            crate::resolver::encode_class(&spec).unwrap(),
        );

        let harness = Harness::new(vec![node.clone()], vec![]);
        let created = handle(&harness.ctx, node).await.unwrap().unwrap();
        assert!(meta::annotation(&created, DRIVER_DATA_ANNOTATION_KEY).is_some());
    }

    /// Story: an unknown provider is fatal, not retried forever
    #[tokio::test]
    async fn story_unknown_provider_is_fatal() {
        let harness = Harness::new(
            vec![ready_node("node-a", "gp-large")],
            vec![class_named("gp-large", "no-such-provider")],
        );

        let node = harness.node("node-a");
        let err = handle(&harness.ctx, node).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
