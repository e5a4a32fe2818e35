//! Machine provisioning backends for Machina
//!
//! A backend turns a node name plus a NodeClass into a real machine. The
//! controller only ever talks to the [`MachineBackend`] and
//! [`MachineHandle`] traits; concrete drivers (cloud APIs, bare metal,
//! libvirt) register themselves in a [`DriverRegistry`] keyed by provider
//! name and serialize their state into an opaque envelope the controller
//! stores on the Node.

#![deny(missing_docs)]

pub mod driver;
pub mod flags;

pub use driver::{
    DriverData, DriverRegistry, HostDescriptor, MachineBackend, MachineDriver, MachineHandle,
    MachineState,
};
pub use flags::{merge_flags, FlagError, FlagSet, FlagSpec, FlagValue};
