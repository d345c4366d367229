//! The contract between the control plane and whatever emulates the data plane

use crate::scenario::ImpairmentSpec;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// A network interface of an emulated node
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InterfaceHandle {
    pub node: Arc<str>,
    pub name: Arc<str>,
}

impl InterfaceHandle {
    pub fn new(node: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
        }
    }
}

impl Display for InterfaceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("interface `{0}` does not exist")]
    UnknownInterface(InterfaceHandle),
    #[error("command failed: {0}")]
    CommandFailed(String),
}

/// Applies addresses and traffic control settings to emulated interfaces
///
/// Implementations are synchronous and may be slow (they typically shell out to `ip` and `tc`
/// inside network namespaces). Callers run them on a blocking thread with a timeout.
pub trait EmulationDriver: Send + Sync {
    /// The interface of `node` that faces `peer`
    fn resolve_interface(&self, node: &str, peer: &str) -> Option<InterfaceHandle>;

    /// Installs `impairment` on the interface, which the caller guarantees is clean
    fn apply_impairment(
        &self,
        interface: &InterfaceHandle,
        impairment: &ImpairmentSpec,
    ) -> Result<(), DriverError>;

    /// Removes any impairment from the interface
    fn clear_impairment(&self, interface: &InterfaceHandle) -> Result<(), DriverError>;

    fn apply_address(
        &self,
        interface: &InterfaceHandle,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), DriverError>;
}
