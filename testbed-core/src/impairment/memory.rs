//! A driver that keeps interface state in memory, for dry runs and tests

use crate::impairment::driver::{DriverError, EmulationDriver, InterfaceHandle};
use crate::scenario::ImpairmentSpec;
use crate::topology::Topology;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum DriverCall {
    Apply(InterfaceHandle),
    Clear(InterfaceHandle),
    Address(InterfaceHandle, Ipv4Addr, u8),
}

#[derive(Default)]
struct MemoryDriverState {
    impairments: HashMap<InterfaceHandle, ImpairmentSpec>,
    addresses: HashMap<InterfaceHandle, (Ipv4Addr, u8)>,
    failing: HashSet<InterfaceHandle>,
    latency: Duration,
    calls: Vec<DriverCall>,
}

pub struct MemoryDriver {
    /// Interfaces by `(node, peer)`, named `{node}-eth{n}` in link order
    interfaces: HashMap<(Arc<str>, Arc<str>), InterfaceHandle>,
    state: Mutex<MemoryDriverState>,
}

impl MemoryDriver {
    pub fn new(topology: &Topology) -> Self {
        let mut interfaces = HashMap::new();
        let mut counters: HashMap<Arc<str>, usize> = HashMap::new();

        for link in &topology.links {
            for (node, peer) in [(&link.src, &link.dst), (&link.dst, &link.src)] {
                let counter = counters.entry(node.clone()).or_default();
                let handle = InterfaceHandle::new(node.clone(), format!("{node}-eth{counter}"));
                *counter += 1;

                // Parallel links share the interface of the first one
                interfaces
                    .entry((node.clone(), peer.clone()))
                    .or_insert(handle);
            }
        }

        Self {
            interfaces,
            state: Mutex::new(MemoryDriverState::default()),
        }
    }

    /// Makes every subsequent call on `interface` fail
    pub fn fail_on(&self, interface: &InterfaceHandle) {
        self.state.lock().failing.insert(interface.clone());
    }

    pub fn recover(&self, interface: &InterfaceHandle) {
        self.state.lock().failing.remove(interface);
    }

    /// Makes every call block the calling thread for `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn interface(&self, node: &str, peer: &str) -> Option<InterfaceHandle> {
        self.interfaces
            .get(&(Arc::from(node), Arc::from(peer)))
            .cloned()
    }

    pub fn impairment_of(&self, interface: &InterfaceHandle) -> Option<ImpairmentSpec> {
        self.state.lock().impairments.get(interface).cloned()
    }

    pub fn address_of(&self, interface: &InterfaceHandle) -> Option<(Ipv4Addr, u8)> {
        self.state.lock().addresses.get(interface).copied()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Records the call and checks it against the injected failures
    fn begin(&self, call: DriverCall) -> Result<(), DriverError> {
        let latency = {
            let mut state = self.state.lock();
            let interface = match &call {
                DriverCall::Apply(i) | DriverCall::Clear(i) | DriverCall::Address(i, ..) => i,
            };

            if !self.interfaces.values().any(|known| known == interface) {
                return Err(DriverError::UnknownInterface(interface.clone()));
            }
            if state.failing.contains(interface) {
                return Err(DriverError::CommandFailed(format!(
                    "injected failure on `{interface}`"
                )));
            }

            state.calls.push(call);
            state.latency
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        Ok(())
    }
}

impl EmulationDriver for MemoryDriver {
    fn resolve_interface(&self, node: &str, peer: &str) -> Option<InterfaceHandle> {
        self.interface(node, peer)
    }

    fn apply_impairment(
        &self,
        interface: &InterfaceHandle,
        impairment: &ImpairmentSpec,
    ) -> Result<(), DriverError> {
        self.begin(DriverCall::Apply(interface.clone()))?;
        for command in impairment.tc_commands(&interface.name) {
            tracing::trace!("{command}");
        }

        self.state
            .lock()
            .impairments
            .insert(interface.clone(), impairment.clone());
        Ok(())
    }

    fn clear_impairment(&self, interface: &InterfaceHandle) -> Result<(), DriverError> {
        self.begin(DriverCall::Clear(interface.clone()))?;
        self.state.lock().impairments.remove(interface);
        Ok(())
    }

    fn apply_address(
        &self,
        interface: &InterfaceHandle,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), DriverError> {
        self.begin(DriverCall::Address(interface.clone(), address, prefix_len))?;
        self.state
            .lock()
            .addresses
            .insert(interface.clone(), (address, prefix_len));
        Ok(())
    }
}
