//! NodeClass custom resource definition
//!
//! A NodeClass names a backend provider, the driver flags used to create
//! machines of this class, descriptive resource capacities, and the
//! OS-level provisioning payload (files, users, commands) applied after the
//! machine is up.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// NodeClass custom resource spec
///
/// Cluster-scoped: node classes describe machine shapes, not tenant state.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "machina.dev",
    version = "v1alpha1",
    kind = "NodeClass",
    plural = "nodeclasses",
    shortname = "nc",
    namespaced = false,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassSpec {
    /// Backend provider id this class provisions through
    pub provider: String,

    /// Driver flags, merged over the driver's declared defaults.
    /// Flags the driver does not declare are ignored.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, String>,

    /// Descriptive resource capacities (cpu, memory, ...) for operators
    /// inspecting the class; the driver flags are what actually size the
    /// machine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,

    /// OS-level provisioning applied once the machine is reachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<ProvisioningConfig>,
}

/// Post-boot provisioning payload: files first, then users, then commands
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningConfig {
    /// Files written to the machine before any command runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,

    /// Users created on the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserSpec>,

    /// Shell commands executed in order, after files and users
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

/// A file placed on the machine during provisioning
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Absolute destination path
    pub path: String,
    /// Octal mode string, e.g. "0644"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// "user:group" owner, defaults to root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Literal file content
    pub content: String,
}

/// A user created on the machine during provisioning
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Login name
    pub name: String,
    /// SSH public keys appended to authorized_keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    /// Grant passwordless sudo
    #[serde(default)]
    pub sudo: bool,
}

impl NodeClassSpec {
    /// Validate the spec beyond what the schema enforces
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.is_empty() {
            return Err("spec.provider must not be empty".to_string());
        }
        if let Some(prov) = &self.provisioning {
            for file in &prov.files {
                if !file.path.starts_with('/') {
                    return Err(format!(
                        "spec.provisioning.files: path {:?} must be absolute",
                        file.path
                    ));
                }
            }
            for user in &prov.users {
                if user.name.is_empty() {
                    return Err("spec.provisioning.users: name must not be empty".to_string());
                }
            }
        }
        Ok(())
    }
}
