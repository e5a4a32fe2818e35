//! Common types for Machina: the NodeClass CRD, errors, phases, and metrics

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod phase;
pub mod telemetry;

pub use error::Error;
pub use phase::NodePhase;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key claiming a Node for this controller
pub const CONTROLLER_LABEL_KEY: &str = "machina.dev/controller";

/// Value of the controller ownership label
pub const CONTROLLER_NAME: &str = "machina";

/// Annotation holding the node's lifecycle phase
pub const PHASE_ANNOTATION_KEY: &str = "machina.dev/state";

/// Annotation referencing the NodeClass by name
pub const CLASS_ANNOTATION_KEY: &str = "machina.dev/node-class";

/// Annotation carrying a base64 JSON snapshot of the NodeClass spec
pub const CLASS_CONTENT_ANNOTATION_KEY: &str = "machina.dev/node-class-content";

/// Annotation holding the serialized backend driver state
pub const DRIVER_DATA_ANNOTATION_KEY: &str = "machina.dev/driver-data";

/// Annotation holding the machine's public IP
pub const PUBLIC_IP_ANNOTATION_KEY: &str = "machina.dev/public-ip";

/// Annotation holding the machine's SSH hostname
pub const HOSTNAME_ANNOTATION_KEY: &str = "machina.dev/hostname";

/// Finalizer guarding backend cleanup on Node deletion
pub const DELETE_FINALIZER: &str = "machina.dev/delete";

/// NoExecute taint applied until the kubelet has joined
pub const NOT_UP_TAINT_KEY: &str = "machina.dev/not-up";

/// Well-known kubelet hostname label, used for sibling matching
pub const HOSTNAME_LABEL_KEY: &str = "kubernetes.io/hostname";

/// Annotations managed by this controller, copied verbatim during migration
pub const MANAGED_ANNOTATION_KEYS: &[&str] = &[
    CLASS_ANNOTATION_KEY,
    CLASS_CONTENT_ANNOTATION_KEY,
    DRIVER_DATA_ANNOTATION_KEY,
    PUBLIC_IP_ANNOTATION_KEY,
    HOSTNAME_ANNOTATION_KEY,
];
