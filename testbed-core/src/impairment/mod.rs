//! Applies and removes impairments on the interfaces a [`Target`] resolves to
//!
//! The engine is the single owner of per-interface impairment state. Applying always clears the
//! interface first, and clearing an interface that carries no impairment is a successful no-op,
//! so repeated applications and removals converge to the same state.

pub mod driver;
pub mod memory;

use crate::impairment::driver::{DriverError, EmulationDriver, InterfaceHandle};
use crate::scenario::ImpairmentSpec;
use crate::scenario::target::{Target, TargetResolutionError};
use crate::topology::Topology;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum ImpairmentState {
    Applied(Arc<ImpairmentSpec>),
    Cleared,
    /// A driver call timed out or panicked, so the interface may or may not carry an impairment
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImpairmentError {
    #[error("no interface of `{node}` faces `{peer}`")]
    UnresolvedInterface { node: Arc<str>, peer: Arc<str> },
    #[error("driver call on `{interface}` failed: {source}")]
    Driver {
        interface: InterfaceHandle,
        #[source]
        source: DriverError,
    },
    #[error("driver call on `{interface}` timed out after {timeout:?}")]
    Timeout {
        interface: InterfaceHandle,
        timeout: Duration,
    },
    #[error("driver call on `{interface}` panicked")]
    Panicked { interface: InterfaceHandle },
}

/// The result of applying or clearing an impairment on a single interface
#[derive(Clone, Debug)]
pub struct InterfaceOutcome {
    pub node: Arc<str>,
    /// The neighbor the interface faces, when the operation was addressed through a target
    pub peer: Option<Arc<str>>,
    pub interface: Option<InterfaceHandle>,
    pub result: Result<(), ImpairmentError>,
}

/// Per-interface outcomes of an operation; every interface is attempted even if some fail
#[derive(Clone, Debug, Default)]
pub struct ApplicationReport {
    pub outcomes: Vec<InterfaceOutcome>,
}

impl ApplicationReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ImpairmentError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceHandle> {
        self.outcomes.iter().filter_map(|o| o.interface.as_ref())
    }
}

/// Runs a driver call on the blocking pool, giving up after `timeout`
///
/// A call that times out keeps running on the blocking pool and may still take effect later.
pub(crate) async fn run_driver_call<F>(
    driver: &Arc<dyn EmulationDriver>,
    interface: &InterfaceHandle,
    timeout: Duration,
    call: F,
) -> Result<(), ImpairmentError>
where
    F: FnOnce(&dyn EmulationDriver, &InterfaceHandle) -> Result<(), DriverError> + Send + 'static,
{
    let driver = driver.clone();
    let handle = interface.clone();
    let task = tokio::task::spawn_blocking(move || call(driver.as_ref(), &handle));

    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(ImpairmentError::Timeout {
            interface: interface.clone(),
            timeout,
        }),
        Ok(Err(_)) => Err(ImpairmentError::Panicked {
            interface: interface.clone(),
        }),
        Ok(Ok(result)) => result.map_err(|source| ImpairmentError::Driver {
            interface: interface.clone(),
            source,
        }),
    }
}

pub struct ImpairmentEngine {
    topology: Arc<Topology>,
    driver: Arc<dyn EmulationDriver>,
    call_timeout: Duration,
    state: Mutex<HashMap<InterfaceHandle, ImpairmentState>>,
    /// Serializes operations, so the clear-then-set sequences of two applications on the same
    /// interface never interleave
    operations: tokio::sync::Mutex<()>,
}

impl ImpairmentEngine {
    pub fn new(
        topology: Arc<Topology>,
        driver: Arc<dyn EmulationDriver>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            driver,
            call_timeout,
            state: Mutex::new(HashMap::new()),
            operations: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self, interface: &InterfaceHandle) -> ImpairmentState {
        self.state
            .lock()
            .get(interface)
            .cloned()
            .unwrap_or(ImpairmentState::Cleared)
    }

    /// Every interface the engine has touched, with its current state
    pub fn snapshot(&self) -> BTreeMap<InterfaceHandle, ImpairmentState> {
        self.state
            .lock()
            .iter()
            .map(|(handle, state)| (handle.clone(), state.clone()))
            .collect()
    }

    pub async fn apply(
        &self,
        target: &Target,
        impairment: Arc<ImpairmentSpec>,
    ) -> Result<ApplicationReport, TargetResolutionError> {
        let pairs = target.interface_pairs(&self.topology)?;
        let _guard = self.operations.lock().await;

        let mut report = ApplicationReport::default();
        for (node, peer) in pairs {
            let interface = self.driver.resolve_interface(&node, &peer);
            let result = match &interface {
                Some(handle) => self.apply_interface(handle, impairment.clone()).await,
                None => Err(ImpairmentError::UnresolvedInterface {
                    node: node.clone(),
                    peer: peer.clone(),
                }),
            };

            log_outcome("apply", &node, &peer, &result);
            report.outcomes.push(InterfaceOutcome {
                node,
                peer: Some(peer),
                interface,
                result,
            });
        }

        Ok(report)
    }

    pub async fn clear(&self, target: &Target) -> Result<ApplicationReport, TargetResolutionError> {
        let pairs = target.interface_pairs(&self.topology)?;
        let _guard = self.operations.lock().await;

        let mut report = ApplicationReport::default();
        for (node, peer) in pairs {
            let interface = self.driver.resolve_interface(&node, &peer);
            let result = match &interface {
                Some(handle) => self.clear_interface(handle).await,
                None => Err(ImpairmentError::UnresolvedInterface {
                    node: node.clone(),
                    peer: peer.clone(),
                }),
            };

            log_outcome("clear", &node, &peer, &result);
            report.outcomes.push(InterfaceOutcome {
                node,
                peer: Some(peer),
                interface,
                result,
            });
        }

        Ok(report)
    }

    pub async fn apply_to_link(
        &self,
        src: &str,
        dst: &str,
        impairment: Arc<ImpairmentSpec>,
    ) -> Result<ApplicationReport, TargetResolutionError> {
        let target = Target::Link {
            src: src.into(),
            dst: dst.into(),
        };
        self.apply(&target, impairment).await
    }

    pub async fn apply_to_path(
        &self,
        hops: &[&str],
        impairment: Arc<ImpairmentSpec>,
    ) -> Result<ApplicationReport, TargetResolutionError> {
        let target = Target::Path(hops.iter().map(|&hop| hop.into()).collect());
        self.apply(&target, impairment).await
    }

    pub async fn apply_to_node(
        &self,
        node: &str,
        impairment: Arc<ImpairmentSpec>,
    ) -> Result<ApplicationReport, TargetResolutionError> {
        self.apply(&Target::Node(node.into()), impairment).await
    }

    pub async fn clear_link(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<ApplicationReport, TargetResolutionError> {
        let target = Target::Link {
            src: src.into(),
            dst: dst.into(),
        };
        self.clear(&target).await
    }

    pub async fn clear_path(&self, hops: &[&str]) -> Result<ApplicationReport, TargetResolutionError> {
        self.clear(&Target::Path(hops.iter().map(|&hop| hop.into()).collect()))
            .await
    }

    pub async fn clear_node(&self, node: &str) -> Result<ApplicationReport, TargetResolutionError> {
        self.clear(&Target::Node(node.into())).await
    }

    /// Clears every interface that currently carries an impairment
    pub async fn clear_all(&self) -> ApplicationReport {
        let _guard = self.operations.lock().await;
        let applied: Vec<InterfaceHandle> = self
            .state
            .lock()
            .iter()
            .filter(|(_, state)| **state != ImpairmentState::Cleared)
            .map(|(handle, _)| handle.clone())
            .collect();

        let mut report = ApplicationReport::default();
        for handle in applied {
            let result = self.clear_interface(&handle).await;
            match &result {
                Ok(()) => tracing::debug!("clear on {handle} succeeded"),
                Err(e) => tracing::warn!("clear on {handle} failed: {e}"),
            }
            report.outcomes.push(InterfaceOutcome {
                node: handle.node.clone(),
                peer: None,
                interface: Some(handle),
                result,
            });
        }

        report
    }

    /// Forgets what an interface carries when its driver call did not report back
    fn settle(
        &self,
        interface: &InterfaceHandle,
        result: Result<(), ImpairmentError>,
    ) -> Result<(), ImpairmentError> {
        if let Err(ImpairmentError::Timeout { .. } | ImpairmentError::Panicked { .. }) = &result {
            self.state
                .lock()
                .insert(interface.clone(), ImpairmentState::Unknown);
        }

        result
    }

    async fn apply_interface(
        &self,
        interface: &InterfaceHandle,
        impairment: Arc<ImpairmentSpec>,
    ) -> Result<(), ImpairmentError> {
        self.clear_interface(interface).await?;

        let spec = impairment.clone();
        let applied = run_driver_call(
            &self.driver,
            interface,
            self.call_timeout,
            move |driver, handle| driver.apply_impairment(handle, &spec),
        )
        .await;
        self.settle(interface, applied)?;

        self.state
            .lock()
            .insert(interface.clone(), ImpairmentState::Applied(impairment));
        Ok(())
    }

    async fn clear_interface(&self, interface: &InterfaceHandle) -> Result<(), ImpairmentError> {
        if self.state(interface) == ImpairmentState::Cleared {
            return Ok(());
        }

        let cleared = run_driver_call(
            &self.driver,
            interface,
            self.call_timeout,
            |driver, handle| driver.clear_impairment(handle),
        )
        .await;
        self.settle(interface, cleared)?;

        self.state
            .lock()
            .insert(interface.clone(), ImpairmentState::Cleared);
        Ok(())
    }
}

fn log_outcome(operation: &str, node: &str, peer: &str, result: &Result<(), ImpairmentError>) {
    match result {
        Ok(()) => tracing::debug!("{operation} on {node} (towards {peer}) succeeded"),
        Err(e) => tracing::warn!("{operation} on {node} (towards {peer}) failed: {e}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::impairment::memory::{DriverCall, MemoryDriver};
    use crate::scenario::NetemSpec;
    use crate::topology::units::Percent;
    use crate::topology::{Link, Node, NodeKind};

    fn setup() -> (Arc<MemoryDriver>, ImpairmentEngine) {
        let topology = Arc::new(Topology::new(
            "t",
            vec![
                Node::new("h1", NodeKind::Host),
                Node::new("r1", NodeKind::Router),
                Node::new("h2", NodeKind::Host),
            ],
            vec![Link::new("h1", "r1"), Link::new("r1", "h2")],
        ));
        let driver = Arc::new(MemoryDriver::new(&topology));
        let engine = ImpairmentEngine::new(topology, driver.clone(), Duration::from_secs(5));
        (driver, engine)
    }

    fn loss(percent: f64) -> Arc<ImpairmentSpec> {
        Arc::new(ImpairmentSpec::netem(NetemSpec::loss(
            Percent::new(percent).unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_apply_clear_apply_is_idempotent() {
        let (driver, engine) = setup();
        let interface = driver.interface("h1", "r1").unwrap();

        engine.apply_to_link("h1", "r1", loss(1.0)).await.unwrap();
        let once = engine.snapshot();

        engine.clear_link("h1", "r1").await.unwrap();
        assert_eq!(engine.state(&interface), ImpairmentState::Cleared);
        assert_eq!(driver.impairment_of(&interface), None);

        engine.apply_to_link("h1", "r1", loss(1.0)).await.unwrap();
        assert_eq!(engine.snapshot(), once);
        assert_eq!(driver.impairment_of(&interface), Some((*loss(1.0)).clone()));
    }

    #[tokio::test]
    async fn test_reapply_clears_first() {
        let (driver, engine) = setup();
        let interface = driver.interface("h1", "r1").unwrap();

        engine.apply_to_link("h1", "r1", loss(1.0)).await.unwrap();
        engine.apply_to_link("h1", "r1", loss(2.0)).await.unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Apply(interface.clone()),
                DriverCall::Clear(interface.clone()),
                DriverCall::Apply(interface.clone()),
            ]
        );
        assert_eq!(
            engine.state(&interface),
            ImpairmentState::Applied(loss(2.0))
        );
    }

    #[tokio::test]
    async fn test_clearing_a_clean_interface_is_a_no_op() {
        let (driver, engine) = setup();

        let report = engine.clear_node("r1").await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 2);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_interfaces() {
        let (driver, engine) = setup();
        let broken = driver.interface("r1", "h1").unwrap();
        let healthy = driver.interface("r1", "h2").unwrap();
        driver.fail_on(&broken);

        let report = engine.apply_to_node("r1", loss(5.0)).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(engine.state(&broken), ImpairmentState::Cleared);
        assert_eq!(engine.state(&healthy), ImpairmentState::Applied(loss(5.0)));
    }

    #[tokio::test]
    async fn test_path_and_clear_all() {
        let (driver, engine) = setup();

        let report = engine
            .apply_to_path(&["h1", "r1", "h2"], loss(1.0))
            .await
            .unwrap();
        let interfaces: Vec<_> = report.interfaces().cloned().collect();
        assert_eq!(
            interfaces,
            vec![
                driver.interface("h1", "r1").unwrap(),
                driver.interface("r1", "h2").unwrap(),
            ]
        );

        let cleared = engine.clear_all().await;
        assert!(cleared.is_success());
        assert_eq!(cleared.outcomes.len(), 2);
        assert!(
            engine
                .snapshot()
                .values()
                .all(|state| *state == ImpairmentState::Cleared)
        );

        // Nothing left to clear
        assert!(engine.clear_path(&["h1", "r1", "h2"]).await.unwrap().is_success());
        assert!(engine.clear_all().await.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let (_, engine) = setup();
        assert_eq!(
            engine.apply_to_link("h1", "h2", loss(1.0)).await.unwrap_err(),
            TargetResolutionError::UnknownLink {
                src: "h1".into(),
                dst: "h2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_slow_driver_times_out() {
        let topology = Arc::new(Topology::new(
            "t",
            vec![
                Node::new("a", NodeKind::Host),
                Node::new("b", NodeKind::Host),
            ],
            vec![Link::new("a", "b")],
        ));
        let driver = Arc::new(MemoryDriver::new(&topology));
        driver.set_latency(Duration::from_millis(300));
        let engine = ImpairmentEngine::new(topology, driver.clone(), Duration::from_millis(20));
        let interface = driver.interface("a", "b").unwrap();

        let report = engine.apply_to_link("a", "b", loss(1.0)).await.unwrap();
        assert!(matches!(
            report.failures().next(),
            Some(ImpairmentError::Timeout { .. })
        ));
        assert_eq!(engine.state(&interface), ImpairmentState::Unknown);

        // The call went through in the end, and clearing still reaches the driver
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(driver.impairment_of(&interface).is_some());
        driver.set_latency(Duration::ZERO);

        let cleared = engine.clear_all().await;
        assert!(cleared.is_success());
        assert_eq!(cleared.outcomes.len(), 1);
        assert_eq!(engine.state(&interface), ImpairmentState::Cleared);
        assert_eq!(driver.impairment_of(&interface), None);
    }
}
