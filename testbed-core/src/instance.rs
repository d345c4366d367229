//! A running topology: everything the control plane owns for one emulated network

use crate::config::EngineConfig;
use crate::event::{Event, EventKind, EventLog, Severity};
use crate::impairment::driver::EmulationDriver;
use crate::impairment::{ImpairmentEngine, ImpairmentError, run_driver_call};
use crate::routing::address::{AddressPlan, AddressPoolExhausted, assign_addresses};
use crate::routing::commands::{RouteCommand, generate_route_commands};
use crate::routing::{Routes, compute_routes};
use crate::scenario::ScenarioSet;
use crate::scheduler::{ScenarioScheduler, ScenarioState};
use crate::topology::Topology;
use crate::topology::compiler::{
    CompiledDocument, ResourceEstimate, ValidationError, ValidationWarning, estimate_resources,
    validate,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("the topology is invalid ({} errors)", .0.len())]
    Invalid(Vec<ValidationError>),
    #[error(transparent)]
    AddressPool(#[from] AddressPoolExhausted),
    #[error("failed to configure the address of `{node}`: {source}")]
    Address {
        node: Arc<str>,
        #[source]
        source: ImpairmentError,
    },
}

pub struct TopologyInstance {
    topology: Arc<Topology>,
    routes: Routes,
    addresses: AddressPlan,
    engine: Arc<ImpairmentEngine>,
    scheduler: ScenarioScheduler,
    events: EventLog,
    warnings: Vec<ValidationWarning>,
    config: EngineConfig,
}

impl TopologyInstance {
    /// Brings up a compiled document: addresses are configured, then scenarios are registered
    pub async fn from_compiled(
        compiled: CompiledDocument,
        driver: Arc<dyn EmulationDriver>,
        config: &EngineConfig,
    ) -> Result<Self, BuildError> {
        let mut instance = Self::build(compiled.topology, compiled.scenarios, driver, config).await?;
        instance.warnings = compiled.warnings;
        Ok(instance)
    }

    /// Validates the topology, plans routes and addresses, pushes the addresses through the
    /// driver and registers every scenario
    ///
    /// Problems with individual scenarios don't prevent the topology from coming up. They are
    /// recorded as events and leave the affected scenario failed.
    pub async fn build(
        topology: Topology,
        scenarios: ScenarioSet,
        driver: Arc<dyn EmulationDriver>,
        config: &EngineConfig,
    ) -> Result<Self, BuildError> {
        let report = validate(&topology, None);
        if !report.is_valid() {
            return Err(BuildError::Invalid(report.errors));
        }

        // The whole plan has to succeed before the driver is touched
        let routes = compute_routes(&topology);
        let addresses = assign_addresses(&topology, &config.address_pool)?;

        let topology = Arc::new(topology);
        let events = EventLog::new(topology.name.as_str());
        push_addresses(&topology, &addresses, &driver, config, &events).await?;

        let engine = Arc::new(ImpairmentEngine::new(
            topology.clone(),
            driver,
            config.driver_call_timeout(),
        ));
        let scheduler = ScenarioScheduler::new(engine.clone(), events.clone());

        events.record(
            Event::new(
                EventKind::TopologyCreated,
                Severity::Info,
                format!(
                    "topology `{}` created with {} nodes and {} links",
                    topology.name,
                    topology.nodes.len(),
                    topology.links.len()
                ),
            )
            .details(serde_json::json!({ "addresses": &addresses })),
        );

        for rejected in &scenarios.rejected {
            let mut event = Event::new(
                EventKind::ScenarioFailed,
                Severity::Error,
                format!("{} scenario could not be read: {}", rejected.kind, rejected.reason),
            );
            if let Some(id) = &rejected.id {
                event = event.scenario(id);
            }
            events.record(event);
        }

        let ScenarioSet {
            persistent,
            transient,
            ..
        } = scenarios;
        for (id, result) in scheduler
            .add_scenarios(persistent.into_iter().chain(transient))
            .await
        {
            match result {
                Ok(ScenarioState::Failed) => tracing::warn!("scenario `{id}` failed to start"),
                Ok(state) => tracing::debug!("scenario `{id}` is {state}"),
                Err(e) => events.record(
                    Event::new(EventKind::SystemWarning, Severity::Warning, e.to_string())
                        .scenario(&id),
                ),
            }
        }

        Ok(Self {
            topology,
            routes,
            addresses,
            engine,
            scheduler,
            events,
            warnings: report.warnings,
            config: config.clone(),
        })
    }

    /// Starts firing scheduled scenarios
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn addresses(&self) -> &AddressPlan {
        &self.addresses
    }

    pub fn route_commands(&self, node: &str) -> Vec<RouteCommand> {
        generate_route_commands(&self.topology, node, &self.routes, &self.addresses)
    }

    pub fn resources(&self) -> ResourceEstimate {
        estimate_resources(&self.topology, &self.config.resource_weights)
    }

    pub fn engine(&self) -> &Arc<ImpairmentEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &ScenarioScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn warnings(&self) -> &[ValidationWarning] {
        &self.warnings
    }

    /// Stops the scheduler and removes every impairment that is still in place
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;

        let leftovers = self.engine.clear_all().await;
        for failure in leftovers.failures() {
            self.events.record(Event::new(
                EventKind::SystemError,
                Severity::Error,
                format!("failed to clean up: {failure}"),
            ));
        }

        self.events.record(Event::new(
            EventKind::TopologyDeleted,
            Severity::Info,
            format!("topology `{}` deleted", self.topology.name),
        ));
    }
}

/// Configures the address of every non-switch link endpoint
async fn push_addresses(
    topology: &Topology,
    addresses: &AddressPlan,
    driver: &Arc<dyn EmulationDriver>,
    config: &EngineConfig,
    events: &EventLog,
) -> Result<(), BuildError> {
    for assignment in &addresses.assignments {
        let endpoints = [
            (&assignment.src_node, &assignment.dst_node, assignment.src_ip),
            (&assignment.dst_node, &assignment.src_node, assignment.dst_ip),
        ];

        for (node, peer, ip) in endpoints {
            if topology.is_switch(node) {
                continue;
            }

            let result = match driver.resolve_interface(node, peer) {
                Some(interface) => {
                    let prefix_len = assignment.prefix_len;
                    run_driver_call(
                        driver,
                        &interface,
                        config.driver_call_timeout(),
                        move |driver, handle| driver.apply_address(handle, ip, prefix_len),
                    )
                    .await
                }
                None => Err(ImpairmentError::UnresolvedInterface {
                    node: node.clone(),
                    peer: peer.clone(),
                }),
            };

            if let Err(source) = result {
                events.record(
                    Event::new(
                        EventKind::SystemError,
                        Severity::Critical,
                        format!("failed to configure {ip} on `{node}`: {source}"),
                    )
                    .node(node)
                    .link(&assignment.link_id),
                );
                return Err(BuildError::Address {
                    node: node.clone(),
                    source,
                });
            }

            tracing::debug!("{node} has {ip}/{} towards {peer}", assignment.prefix_len);
        }
    }

    Ok(())
}
