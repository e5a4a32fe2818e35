//! Node lifecycle phases

use k8s_openapi::api::core::v1::Node;

use crate::PHASE_ANNOTATION_KEY;

/// Lifecycle phase of a managed node
///
/// Only the four forward phases are ever persisted in the phase annotation.
/// `Deleting` is derived from `metadata.deletionTimestamp` at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    /// Machine not yet created, or waiting to reach its running state
    Pending,
    /// Machine up, OS-level provisioning in progress
    Provisioning,
    /// Provisioned, waiting for the kubelet to join
    Launching,
    /// Kubelet joined, steady state
    Running,
    /// Deletion timestamp set, teardown or migration in progress
    Deleting,
}

impl NodePhase {
    /// Parse a stored phase annotation. Unrecognized or absent values
    /// normalize to `Pending` so a node with a corrupt annotation re-enters
    /// the state machine at the top rather than wedging.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("provisioning") => Self::Provisioning,
            Some("launching") => Self::Launching,
            Some("running") => Self::Running,
            _ => Self::Pending,
        }
    }

    /// Effective phase of a node: the stored annotation, overridden to
    /// `Deleting` when the API server has stamped a deletion timestamp.
    pub fn of(node: &Node) -> Self {
        if node.metadata.deletion_timestamp.is_some() {
            return Self::Deleting;
        }
        Self::parse(
            node.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PHASE_ANNOTATION_KEY))
                .map(String::as_str),
        )
    }

    /// Annotation / metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
