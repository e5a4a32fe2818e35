//! Backend traits and the driver registry
//!
//! `MachineBackend` is the controller-facing seam: create a handle for a
//! new machine, or rehydrate one from the serialized driver data stored on
//! the Node. `MachineDriver` is the per-provider factory registered under
//! its provider name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use machina_common::crd::ProvisioningConfig;
use machina_common::{Error, Result};

use crate::flags::{FlagSet, FlagSpec};

/// Observed run state of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Machine is being created or booted
    Starting,
    /// Machine is up
    Running,
    /// Machine exists but is not running
    Stopped,
    /// Machine is in an error state on the provider side
    Errored,
    /// Driver could not determine the state
    Unknown,
}

/// Identity of a machine to create, derived from the Node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    /// Machine name, always the node name
    pub name: String,
}

impl HostDescriptor {
    /// Descriptor for the machine backing the named node
    pub fn for_node(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Serialized driver state envelope stored in the driver-data annotation
///
/// The `state` payload is opaque to the controller; only the originating
/// driver interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverData {
    /// Provider name of the driver that produced this state
    pub driver: String,
    /// Machine name
    pub name: String,
    /// Driver-private state
    pub state: serde_json::Value,
}

impl DriverData {
    /// Parse an envelope from the annotation value
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::serialization_for_kind("DriverData", e.to_string()))
    }

    /// Serialize the envelope for storage in the annotation
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("DriverData", e.to_string()))
    }
}

/// A live handle to one machine
///
/// Handles are stateful: `create` and `provision` mutate the underlying
/// machine and the driver state that `driver_data` serializes.
#[async_trait]
pub trait MachineHandle: Send + Sync {
    /// Flags this driver understands, with defaults
    fn declared_flags(&self) -> Vec<FlagSpec>;

    /// Apply a resolved flag set before `create`
    fn configure(&mut self, flags: &FlagSet) -> Result<()>;

    /// Create the machine on the provider
    async fn create(&mut self) -> Result<()>;

    /// Run OS-level provisioning: engine install, files, users, commands
    async fn provision(&mut self, config: &ProvisioningConfig) -> Result<()>;

    /// Public IP of the machine
    async fn ip(&self) -> Result<String>;

    /// Hostname the controller can SSH to
    async fn ssh_hostname(&self) -> Result<String>;

    /// Current run state
    async fn run_state(&self) -> Result<MachineState>;

    /// Destroy the machine on the provider
    async fn remove(&mut self) -> Result<()>;

    /// Serialize driver state for the driver-data annotation
    fn driver_data(&self) -> Result<String>;
}

/// Controller-facing backend seam
#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// Create a handle for a machine that does not exist yet
    async fn new_host(
        &self,
        provider: &str,
        descriptor: HostDescriptor,
    ) -> Result<Box<dyn MachineHandle>>;

    /// Rehydrate a handle from serialized driver data
    async fn load(&self, driver_data: &str) -> Result<Box<dyn MachineHandle>>;
}

/// Per-provider driver factory
pub trait MachineDriver: Send + Sync {
    /// Provider name this driver registers under
    fn provider(&self) -> &str;

    /// Fresh handle for a machine to be created
    fn new_host(&self, descriptor: HostDescriptor) -> Box<dyn MachineHandle>;

    /// Handle rehydrated from a previously serialized envelope
    fn load(&self, data: &DriverData) -> Result<Box<dyn MachineHandle>>;
}

/// Registry of drivers keyed by provider name, used as the backend
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn MachineDriver>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its provider name
    pub fn register(&mut self, driver: Arc<dyn MachineDriver>) {
        self.drivers.insert(driver.provider().to_string(), driver);
    }

    /// Registered provider names
    pub fn providers(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    fn driver(&self, provider: &str, node: &str) -> Result<&Arc<dyn MachineDriver>> {
        self.drivers.get(provider).ok_or_else(|| {
            Error::backend_fatal(node, provider, "no driver registered for provider")
        })
    }
}

#[async_trait]
impl MachineBackend for DriverRegistry {
    async fn new_host(
        &self,
        provider: &str,
        descriptor: HostDescriptor,
    ) -> Result<Box<dyn MachineHandle>> {
        let driver = self.driver(provider, &descriptor.name)?;
        tracing::debug!(provider, machine = %descriptor.name, "creating host handle");
        Ok(driver.new_host(descriptor))
    }

    async fn load(&self, driver_data: &str) -> Result<Box<dyn MachineHandle>> {
        let data = DriverData::parse(driver_data)?;
        let driver = self.driver(&data.driver, &data.name)?;
        driver.load(&data)
    }
}
