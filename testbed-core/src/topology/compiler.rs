//! Turns a declarative document into a validated [`Topology`]
//!
//! Validation never fails fast: every check runs and all problems are reported together, so
//! operators can fix a document in one go.

use crate::scenario::schedule::{Schedule, SchedulingError};
use crate::scenario::target::TargetResolutionError;
use crate::scenario::{ScenarioKind, ScenarioSet};
use crate::topology::document::{Document, LoadedDocument};
use crate::topology::{KNOWN_DAEMONS, KNOWN_SERVICES, NodeKind, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Routers without an explicit ASN get this one
pub const DEFAULT_ASN: u32 = 65000;

#[derive(Clone, Debug)]
pub struct CompilerConfig {
    pub default_asn: Option<u32>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            default_asn: Some(DEFAULT_ASN),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("duplicate node id `{0}`")]
    DuplicateNode(Arc<str>),
    #[error("link `{link}` references unknown node `{node}`")]
    DanglingEndpoint { link: Arc<str>, node: Arc<str> },
    #[error("router `{0}` runs bgp but has no ASN")]
    BgpWithoutAsn(Arc<str>),
    #[error("{kind} `{node}` declares daemons, but only routers run them")]
    DaemonsOnNonRouter { node: Arc<str>, kind: NodeKind },
    #[error("router `{node}` declares unknown daemon `{daemon}`")]
    UnknownDaemon { node: Arc<str>, daemon: String },
    #[error("{kind} `{node}` declares services, but only hosts run them")]
    ServicesOnNonHost { node: Arc<str>, kind: NodeKind },
    #[error("host `{node}` declares unknown service `{service}`")]
    UnknownService { node: Arc<str>, service: String },
    #[error("scenario `{}` could not be read: {reason}", .id.as_deref().unwrap_or("<unnamed>"))]
    UnreadableScenario { id: Option<String>, reason: String },
    #[error("scenario `{scenario}` has an unresolvable target: {source}")]
    UnresolvedTarget {
        scenario: Arc<str>,
        #[source]
        source: TargetResolutionError,
    },
    #[error("duplicate scenario id `{0}`")]
    DuplicateScenario(Arc<str>),
    #[error("monitoring point `{mp_id}` attaches to unknown node `{node}`")]
    UnknownIngressNode { mp_id: String, node: Arc<str> },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    #[error("node `{0}` has no links")]
    IsolatedNode(Arc<str>),
    #[error("transient scenario `{0}` has no schedule and will only run when triggered")]
    MissingSchedule(Arc<str>),
    #[error("scenario `{scenario}` will not be scheduled: {source}")]
    InvalidSchedule {
        scenario: Arc<str>,
        #[source]
        source: SchedulingError,
    },
    #[error("scenario `{0}` declares no impairment")]
    EmptyImpairment(Arc<str>),
}

#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Document(#[from] crate::topology::document::DocumentError),
    #[error("the topology is invalid ({} errors)", .0.len())]
    Invalid(Vec<ValidationError>),
}

#[derive(Clone, Debug)]
pub struct CompiledDocument {
    pub topology: Topology,
    pub scenarios: ScenarioSet,
    pub warnings: Vec<ValidationWarning>,
}

/// Converts a parsed document into model types, without checking its semantics
pub fn load(document: Document, config: &CompilerConfig) -> LoadedDocument {
    document.into_model(config)
}

pub fn validate(topology: &Topology, scenarios: Option<&ScenarioSet>) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut seen = HashSet::new();
    for node in &topology.nodes {
        if !seen.insert(&node.id) {
            report
                .errors
                .push(ValidationError::DuplicateNode(node.id.clone()));
        }
    }

    for link in &topology.links {
        for endpoint in [&link.src, &link.dst] {
            if !topology.has_node(endpoint) {
                report.errors.push(ValidationError::DanglingEndpoint {
                    link: link.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
    }

    for node in &topology.nodes {
        if topology.links_of(&node.id).next().is_none() {
            report
                .warnings
                .push(ValidationWarning::IsolatedNode(node.id.clone()));
        }
    }

    check_daemons_and_services(topology, &mut report);

    if let Some(scenarios) = scenarios {
        check_scenarios(topology, scenarios, &mut report);
    }

    if let Some(ingress) = &topology.ingress {
        for assignment in &ingress.assign {
            if !topology.has_node(&assignment.attach_to) {
                report.errors.push(ValidationError::UnknownIngressNode {
                    mp_id: assignment.mp_id.clone(),
                    node: assignment.attach_to.clone(),
                });
            }
        }
    }

    report
}

fn check_daemons_and_services(topology: &Topology, report: &mut ValidationReport) {
    for node in &topology.nodes {
        if node.kind == NodeKind::Router {
            if node.speaks_bgp() && node.asn.is_none_or(|asn| asn == 0) {
                report
                    .errors
                    .push(ValidationError::BgpWithoutAsn(node.id.clone()));
            }

            for daemon in &node.daemons {
                if !KNOWN_DAEMONS.contains(&daemon.as_str()) {
                    report.errors.push(ValidationError::UnknownDaemon {
                        node: node.id.clone(),
                        daemon: daemon.clone(),
                    });
                }
            }
        } else if !node.daemons.is_empty() {
            report.errors.push(ValidationError::DaemonsOnNonRouter {
                node: node.id.clone(),
                kind: node.kind,
            });
        }

        if node.kind == NodeKind::Host {
            for service in &node.services {
                if !KNOWN_SERVICES.contains(&service.as_str()) {
                    report.errors.push(ValidationError::UnknownService {
                        node: node.id.clone(),
                        service: service.clone(),
                    });
                }
            }
        } else if !node.services.is_empty() {
            report.errors.push(ValidationError::ServicesOnNonHost {
                node: node.id.clone(),
                kind: node.kind,
            });
        }
    }
}

fn check_scenarios(topology: &Topology, scenarios: &ScenarioSet, report: &mut ValidationReport) {
    for rejected in &scenarios.rejected {
        report.errors.push(ValidationError::UnreadableScenario {
            id: rejected.id.clone(),
            reason: rejected.reason.clone(),
        });
    }

    let mut seen = HashSet::new();
    for scenario in scenarios.iter() {
        if !seen.insert(&scenario.id) {
            report
                .errors
                .push(ValidationError::DuplicateScenario(scenario.id.clone()));
        }

        let resolved = scenario
            .target()
            .and_then(|target| target.interface_pairs(topology));
        if let Err(source) = resolved {
            report.errors.push(ValidationError::UnresolvedTarget {
                scenario: scenario.id.clone(),
                source,
            });
        }

        if scenario.impairment.is_empty() {
            report
                .warnings
                .push(ValidationWarning::EmptyImpairment(scenario.id.clone()));
        }

        if scenario.kind != ScenarioKind::Transient {
            continue;
        }

        match &scenario.schedule {
            None => report
                .warnings
                .push(ValidationWarning::MissingSchedule(scenario.id.clone())),
            Some(schedule) => {
                if let Err(source) = schedule.parse::<Schedule>() {
                    report.warnings.push(ValidationWarning::InvalidSchedule {
                        scenario: scenario.id.clone(),
                        source,
                    });
                }
            }
        }

        if let Err(source) = scenario.active_duration() {
            report.warnings.push(ValidationWarning::InvalidSchedule {
                scenario: scenario.id.clone(),
                source,
            });
        }
    }
}

/// Loads and validates a document, rejecting it if any error is found
pub fn compile(
    document: Document,
    config: &CompilerConfig,
) -> Result<CompiledDocument, CompileError> {
    let loaded = load(document, config);
    let report = validate(&loaded.topology, Some(&loaded.scenarios));
    if !report.is_valid() {
        return Err(CompileError::Invalid(report.errors));
    }

    Ok(CompiledDocument {
        topology: loaded.topology,
        scenarios: loaded.scenarios,
        warnings: report.warnings,
    })
}

/// Weights used to estimate the host resources a topology needs once emulated
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceWeights {
    pub switch_cpu: f64,
    pub switch_memory_mb: u64,
    pub router_cpu: f64,
    pub router_memory_mb: u64,
    pub host_cpu: f64,
    pub host_memory_mb: u64,
    pub link_cpu: f64,
    pub service_cpu: f64,
    pub service_memory_mb: u64,
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self {
            switch_cpu: 0.1,
            switch_memory_mb: 32,
            router_cpu: 0.5,
            router_memory_mb: 128,
            host_cpu: 0.2,
            host_memory_mb: 64,
            link_cpu: 0.05,
            service_cpu: 0.3,
            service_memory_mb: 128,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceEstimate {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub node_count: usize,
    pub link_count: usize,
    pub router_count: usize,
    pub service_count: usize,
}

pub fn estimate_resources(topology: &Topology, weights: &ResourceWeights) -> ResourceEstimate {
    let mut cpu = 0.0;
    let mut memory_mb = 0;
    let mut router_count = 0;
    let mut service_count = 0;

    for node in &topology.nodes {
        let (node_cpu, node_memory) = match node.kind {
            NodeKind::Switch => (weights.switch_cpu, weights.switch_memory_mb),
            NodeKind::Router => {
                router_count += 1;
                (weights.router_cpu, weights.router_memory_mb)
            }
            NodeKind::Host => (weights.host_cpu, weights.host_memory_mb),
        };
        cpu += node_cpu;
        memory_mb += node_memory;

        let services = node.services.len();
        service_count += services;
        cpu += weights.service_cpu * services as f64;
        memory_mb += weights.service_memory_mb * services as u64;
    }

    cpu += weights.link_cpu * topology.links.len() as f64;

    ResourceEstimate {
        cpu_cores: (cpu * 100.0).round() / 100.0,
        memory_mb,
        node_count: topology.nodes.len(),
        link_count: topology.links.len(),
        router_count,
        service_count,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scenario::{ImpairmentSpec, NetemSpec, ScenarioSpec};
    use crate::topology::units::Percent;
    use crate::topology::{Link, Node};

    fn node(id: &str, kind: NodeKind) -> Node {
        Node::new(id, kind)
    }

    fn small() -> Topology {
        let mut r1 = node("r1", NodeKind::Router);
        r1.daemons.insert("ospf".to_string());
        let mut h2 = node("h2", NodeKind::Host);
        h2.services.insert("http".to_string());

        Topology::new(
            "small",
            vec![node("h1", NodeKind::Host), r1, h2],
            vec![Link::new("h1", "r1"), Link::new("r1", "h2")],
        )
    }

    fn loss() -> ImpairmentSpec {
        ImpairmentSpec::netem(NetemSpec::loss(Percent::new(1.0).unwrap()))
    }

    #[test]
    fn test_valid_topology() {
        let report = validate(&small(), None);
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_structural_errors() {
        let mut topology = small();
        topology.nodes.push(node("h1", NodeKind::Host));
        topology.nodes.push(node("lonely", NodeKind::Switch));
        topology.links.push(Link::new("r1", "h3"));

        let report = validate(&topology, None);
        assert_eq!(
            report.errors,
            vec![
                ValidationError::DuplicateNode("h1".into()),
                ValidationError::DanglingEndpoint {
                    link: "r1-h3".into(),
                    node: "h3".into()
                },
            ]
        );
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::IsolatedNode("lonely".into())]
        );
        assert!(report.errors[1].to_string().contains("h3"));
    }

    #[test]
    fn test_isolated_nodes_only_warn() {
        let mut topology = small();
        topology.nodes.push(node("h9", NodeKind::Host));

        let report = validate(&topology, None);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_daemon_and_service_consistency() {
        let mut bgp = node("r2", NodeKind::Router);
        bgp.daemons.insert("bgp".to_string());
        bgp.daemons.insert("eigrp".to_string());
        let mut zero_asn = node("r3", NodeKind::Router);
        zero_asn.asn = Some(0);
        zero_asn.daemons.insert("bgp".to_string());
        let mut host = node("h3", NodeKind::Host);
        host.daemons.insert("ospf".to_string());
        host.services.insert("gopher".to_string());
        let mut switch = node("s1", NodeKind::Switch);
        switch.services.insert("dns".to_string());

        let mut topology = small();
        topology.nodes.extend([bgp, zero_asn, host, switch]);
        for id in ["r2", "r3", "h3", "s1"] {
            topology.links.push(Link::new("r1", id));
        }

        let report = validate(&topology, None);
        assert_eq!(
            report.errors,
            vec![
                ValidationError::BgpWithoutAsn("r2".into()),
                ValidationError::UnknownDaemon {
                    node: "r2".into(),
                    daemon: "eigrp".to_string()
                },
                ValidationError::BgpWithoutAsn("r3".into()),
                ValidationError::DaemonsOnNonRouter {
                    node: "h3".into(),
                    kind: NodeKind::Host
                },
                ValidationError::UnknownService {
                    node: "h3".into(),
                    service: "gopher".to_string()
                },
                ValidationError::ServicesOnNonHost {
                    node: "s1".into(),
                    kind: NodeKind::Switch
                },
            ]
        );
    }

    #[test]
    fn test_scenario_checks() {
        let scenarios = ScenarioSet {
            persistent: vec![
                ScenarioSpec::persistent("ok", "link:r1->h1", loss()),
                ScenarioSpec::persistent("ok", "node:r1", loss()),
                ScenarioSpec::persistent("ghost", "node:r9", loss()),
                ScenarioSpec::persistent("gap", "path:h1->h2", loss()),
                ScenarioSpec::persistent("noop", "node:h1", ImpairmentSpec::default()),
            ],
            transient: vec![
                ScenarioSpec::transient("manual", "node:h2", loss(), None, None),
                ScenarioSpec::transient(
                    "bad-cron",
                    "node:h2",
                    loss(),
                    Some("whenever".to_string()),
                    Some("PT1M".to_string()),
                ),
            ],
            rejected: Vec::new(),
        };

        let report = validate(&small(), Some(&scenarios));
        assert_eq!(report.errors.len(), 3);
        assert_eq!(
            report.errors[0],
            ValidationError::DuplicateScenario("ok".into())
        );
        assert!(matches!(
            &report.errors[1],
            ValidationError::UnresolvedTarget {
                source: TargetResolutionError::UnknownNode(_),
                ..
            }
        ));
        assert!(matches!(
            &report.errors[2],
            ValidationError::UnresolvedTarget {
                source: TargetResolutionError::UnknownLink { .. },
                ..
            }
        ));

        assert_eq!(
            report.warnings,
            vec![
                ValidationWarning::EmptyImpairment("noop".into()),
                ValidationWarning::MissingSchedule("manual".into()),
                ValidationWarning::InvalidSchedule {
                    scenario: "bad-cron".into(),
                    source: "whenever".parse::<Schedule>().unwrap_err(),
                },
            ]
        );
    }

    #[test]
    fn test_compile_rejects_invalid_documents() {
        let yaml = r#"
topology:
  name: broken
  nodes:
    - { id: h1, type: host }
    - { id: r1, type: router }
  links:
    - [h1, r1]
    - [r1, h3]
"#;
        let document = Document::from_yaml_str(yaml).unwrap();
        let Err(CompileError::Invalid(errors)) = compile(document, &CompilerConfig::default())
        else {
            panic!("expected the document to be rejected");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("h3"));
    }

    #[test]
    fn test_estimate_resources() {
        let mut topology = small();
        topology.nodes.push(node("s1", NodeKind::Switch));
        topology.links.push(Link::new("r1", "s1"));

        let estimate = estimate_resources(&topology, &ResourceWeights::default());
        // 2 hosts (0.4) + router (0.5) + switch (0.1) + 3 links (0.15) + 1 service (0.3)
        assert_eq!(estimate.cpu_cores, 1.45);
        assert_eq!(estimate.memory_mb, 64 * 2 + 128 + 32 + 128);
        assert_eq!(estimate.node_count, 4);
        assert_eq!(estimate.link_count, 3);
        assert_eq!(estimate.router_count, 1);
        assert_eq!(estimate.service_count, 1);
    }
}
