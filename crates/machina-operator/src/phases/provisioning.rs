//! Provisioning phase: OS-level setup through the backend
//!
//! The machine is up; run the class's provisioning payload (engine
//! install, files, users, commands) and advance to launching. The backend
//! call is synchronous from the worker's point of view and may take
//! minutes.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use machina_common::{Error, NodePhase, Result, DRIVER_DATA_ANNOTATION_KEY};

use crate::controller::Context;
use crate::meta;
use crate::resolver::resolve_class;

/// Provision the machine and advance to launching
pub async fn handle(ctx: &Arc<Context>, mut node: Node) -> Result<Option<Node>> {
    let name = meta::name(&node).to_string();

    let driver_data = meta::annotation(&node, DRIVER_DATA_ANNOTATION_KEY)
        .ok_or_else(|| Error::config_for(&name, "provisioning node has no driver data"))?
        .to_string();
    let spec = resolve_class(&node, ctx.classes.as_ref())?;

    let mut handle = ctx.backend.load(&driver_data).await?;
    let config = spec.provisioning.clone().unwrap_or_default();

    info!(node = %name, provider = %spec.provider, "provisioning machine");
    handle.provision(&config).await?;

    // The driver may have refreshed credentials or state during provisioning
    meta::set_annotation(&mut node, DRIVER_DATA_ANNOTATION_KEY, handle.driver_data()?);
    meta::set_phase(&mut node, NodePhase::Launching);
    Ok(Some(node))
}
