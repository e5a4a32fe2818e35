//! NodeClass resolution
//!
//! A node references its class two ways: an embedded base64 JSON snapshot
//! of the spec, or a by-name reference resolved through the class cache.
//! The snapshot wins, so a node keeps provisioning exactly as declared even
//! if the class object changes or disappears mid-flight.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Node;

use machina_common::crd::{NodeClass, NodeClassSpec};
use machina_common::{
    Error, Result, CLASS_ANNOTATION_KEY, CLASS_CONTENT_ANNOTATION_KEY,
};

use crate::cache::ObjectCache;
use crate::meta;

/// Resolve the NodeClass spec for a node
pub fn resolve_class(node: &Node, classes: &dyn ObjectCache<NodeClass>) -> Result<NodeClassSpec> {
    let name = meta::name(node);

    if let Some(content) = meta::annotation(node, CLASS_CONTENT_ANNOTATION_KEY) {
        let raw = BASE64.decode(content).map_err(|e| {
            Error::config_for(name, format!("embedded class content is not valid base64: {e}"))
        })?;
        let spec: NodeClassSpec = serde_json::from_slice(&raw).map_err(|e| {
            Error::config_for(name, format!("embedded class content is not a valid spec: {e}"))
        })?;
        return Ok(spec);
    }

    let class_name = meta::annotation(node, CLASS_ANNOTATION_KEY)
        .ok_or_else(|| Error::config_for(name, "node has no class reference"))?;

    let class = classes
        .get(class_name)
        .ok_or_else(|| Error::class_not_found(class_name))?;
    Ok(class.spec.clone())
}

/// Encode a class spec for the embedded content annotation
pub fn encode_class(spec: &NodeClassSpec) -> Result<String> {
    let raw = serde_json::to_vec(spec)
        .map_err(|e| Error::serialization_for_kind("NodeClassSpec", e.to_string()))?;
    Ok(BASE64.encode(raw))
}
