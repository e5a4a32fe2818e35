//! Node metadata helpers
//!
//! Small pure functions over `Node` metadata: annotations, the ownership
//! label, the delete finalizer, the not-up taint, and kubelet join
//! detection. All mutation happens on in-memory copies; persistence is the
//! reconcile loop's diff-patch.

use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};

use machina_common::{
    NodePhase, CONTROLLER_LABEL_KEY, CONTROLLER_NAME, DELETE_FINALIZER, HOSTNAME_LABEL_KEY,
    NOT_UP_TAINT_KEY, PHASE_ANNOTATION_KEY,
};

/// Reason the kubelet reports on conditions it has never updated
const NEVER_UPDATED_REASON: &str = "NodeStatusNeverUpdated";

/// Read an annotation, treating empty values as absent
pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Set an annotation on the working copy
pub fn set_annotation(node: &mut Node, key: &str, value: impl Into<String>) {
    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.into());
}

/// Persist a phase into the phase annotation
pub fn set_phase(node: &mut Node, phase: NodePhase) {
    set_annotation(node, PHASE_ANNOTATION_KEY, phase.as_str());
}

/// Whether this controller claims the node
pub fn is_owned(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CONTROLLER_LABEL_KEY))
        .is_some_and(|v| v == CONTROLLER_NAME)
}

/// Claim the node for this controller
pub fn set_owner_label(node: &mut Node) {
    node.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CONTROLLER_LABEL_KEY.to_string(), CONTROLLER_NAME.to_string());
}

/// The kubelet-registered hostname label, if non-empty
pub fn hostname_label(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(HOSTNAME_LABEL_KEY))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Whether the delete finalizer is present
pub fn has_finalizer(node: &Node) -> bool {
    node.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|n| n == DELETE_FINALIZER))
}

/// Add the delete finalizer; returns false if already present
pub fn add_finalizer(node: &mut Node) -> bool {
    if has_finalizer(node) {
        return false;
    }
    node.metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(DELETE_FINALIZER.to_string());
    true
}

/// Remove the delete finalizer from the working copy
pub fn remove_finalizer(node: &mut Node) {
    if let Some(finalizers) = node.metadata.finalizers.as_mut() {
        finalizers.retain(|n| n != DELETE_FINALIZER);
    }
}

/// Whether the not-up taint is present
pub fn has_not_up_taint(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|t| t.iter().any(|t| t.key == NOT_UP_TAINT_KEY))
}

/// Taint the node NoExecute until the kubelet joins; returns false if
/// already tainted
pub fn add_not_up_taint(node: &mut Node) -> bool {
    if has_not_up_taint(node) {
        return false;
    }
    node.spec
        .get_or_insert_with(NodeSpec::default)
        .taints
        .get_or_insert_with(Vec::new)
        .push(Taint {
            key: NOT_UP_TAINT_KEY.to_string(),
            effect: "NoExecute".to_string(),
            ..Default::default()
        });
    true
}

/// Drop the not-up taint from the working copy
pub fn remove_not_up_taint(node: &mut Node) {
    if let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) {
        taints.retain(|t| t.key != NOT_UP_TAINT_KEY);
    }
}

/// Whether a real kubelet has reported status for this node
///
/// Freshly registered objects either have no conditions at all or carry
/// placeholder conditions with the never-updated reason.
pub fn has_joined(node: &Node) -> bool {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    if conditions.is_empty() {
        return false;
    }
    !conditions
        .iter()
        .any(|c| c.reason.as_deref() == Some(NEVER_UPDATED_REASON))
}

/// Object UID, empty when unset
pub fn uid(node: &Node) -> &str {
    node.metadata.uid.as_deref().unwrap_or("")
}

/// Object name, empty when unset
pub fn name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("")
}
