//! The declarative document operators write: a `topology` section and an optional `scenarios`
//! section, in YAML or JSON

use crate::scenario::{
    DEFAULT_PRIORITY, ImpairmentSpec, NetemSpec, QdiscSpec, RejectedScenario, ScenarioKind,
    ScenarioSet, ScenarioSpec,
};
use crate::topology::compiler::CompilerConfig;
use crate::topology::units::{Bandwidth, Percent, TimeSpan};
use crate::topology::{
    IngressAssignment, IngressConfig, IngressKind, Link, LinkParams, Node, NodeKind, Shaping,
    Topology,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("failed to read document `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize, Clone, Debug)]
pub struct Document {
    topology: TopologyJson,
    #[serde(default)]
    scenarios: ScenariosJson,
}

#[derive(Deserialize, Clone, Debug)]
struct TopologyJson {
    name: String,
    nodes: Vec<NodeJson>,
    links: Vec<LinkJson>,
    #[serde(default)]
    mp_ingress: Option<IngressJson>,
    #[serde(default)]
    metadata: JsonMap,
}

#[derive(Deserialize, Clone, Debug)]
struct NodeJson {
    id: String,
    #[serde(rename = "type")]
    kind: NodeKindJson,
    #[serde(default)]
    asn: Option<u32>,
    #[serde(default)]
    daemons: Vec<String>,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    config: JsonMap,
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
enum NodeKindJson {
    Switch,
    Router,
    Host,
}

/// Links are written either as records or as `[src, dst]` / `[src, dst, params]` tuples
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
enum LinkJson {
    Record {
        #[serde(default)]
        id: Option<String>,
        src: String,
        dst: String,
        #[serde(default)]
        params: LinkParamsJson,
    },
    WithParams(String, String, LinkParamsJson),
    Bare(String, String),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct LinkParamsJson {
    #[serde(default, alias = "bandwidth")]
    bw: Option<Bandwidth>,
    #[serde(default)]
    delay: Option<TimeSpan>,
    #[serde(default)]
    loss: Option<Percent>,
    #[serde(default)]
    jitter: Option<TimeSpan>,
    #[serde(default)]
    max_queue_size: Option<u32>,
    #[serde(default = "default_use_htb")]
    use_htb: bool,
    #[serde(default)]
    use_tbf: bool,
}

fn default_use_htb() -> bool {
    true
}

impl Default for LinkParamsJson {
    fn default() -> Self {
        Self {
            bw: None,
            delay: None,
            loss: None,
            jitter: None,
            max_queue_size: None,
            use_htb: true,
            use_tbf: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
struct IngressJson {
    #[serde(rename = "type", default)]
    kind: IngressKindJson,
    #[serde(default)]
    assign: Vec<IngressAssignmentJson>,
}

#[derive(Deserialize, Clone, Copy, Debug, Default)]
#[serde(rename_all = "lowercase")]
enum IngressKindJson {
    #[default]
    Wireguard,
    Openvpn,
    Gre,
}

#[derive(Deserialize, Clone, Debug)]
struct IngressAssignmentJson {
    mp_id: String,
    attach_to: String,
    #[serde(default)]
    vrf: Option<String>,
    #[serde(default)]
    config: JsonMap,
}

/// Scenario records are kept as raw values so that one malformed record doesn't reject the
/// whole document
#[derive(Deserialize, Clone, Debug, Default)]
struct ScenariosJson {
    #[serde(default)]
    persistent: Vec<serde_json::Value>,
    #[serde(default)]
    transient: Vec<serde_json::Value>,
}

#[derive(Deserialize, Clone, Debug)]
struct ScenarioJson {
    id: String,
    #[serde(alias = "target")]
    applies_to: String,
    #[serde(default)]
    impairments: Option<ImpairmentsJson>,
    #[serde(default)]
    netem: Option<NetemSpec>,
    #[serde(default)]
    qdisc: Option<QdiscSpec>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    duration: Option<StringOrSeconds>,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: JsonMap,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
enum ImpairmentsJson {
    Composite(ImpairmentSpec),
    Flat(NetemSpec),
}

/// YAML readily turns `duration: 90` into a number
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
enum StringOrSeconds {
    Seconds(u64),
    String(String),
}

impl From<StringOrSeconds> for String {
    fn from(value: StringOrSeconds) -> Self {
        match value {
            StringOrSeconds::Seconds(secs) => secs.to_string(),
            StringOrSeconds::String(s) => s,
        }
    }
}

/// The model types obtained from a document, before semantic validation
#[derive(Clone, Debug)]
pub struct LoadedDocument {
    pub topology: Topology,
    pub scenarios: ScenarioSet,
}

impl Document {
    pub fn from_yaml_str(input: &str) -> Result<Self, DocumentError> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_json_str(input: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Reads a document from disk, using the file extension to tell JSON from YAML
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    pub fn into_model(self, config: &CompilerConfig) -> LoadedDocument {
        LoadedDocument {
            topology: self.topology.into_topology(config),
            scenarios: self.scenarios.into(),
        }
    }
}

impl TopologyJson {
    fn into_topology(self, config: &CompilerConfig) -> Topology {
        let nodes = self
            .nodes
            .into_iter()
            .map(|n| {
                let kind = match n.kind {
                    NodeKindJson::Switch => NodeKind::Switch,
                    NodeKindJson::Router => NodeKind::Router,
                    NodeKindJson::Host => NodeKind::Host,
                };
                let asn = match kind {
                    NodeKind::Router => n.asn.or(config.default_asn),
                    _ => n.asn,
                };

                Node {
                    id: n.id.into(),
                    kind,
                    asn,
                    daemons: n.daemons.into_iter().collect(),
                    services: n.services.into_iter().collect(),
                    config: n.config,
                }
            })
            .collect();

        let mut pair_counts: HashMap<(String, String), usize> = HashMap::new();
        let links = self
            .links
            .into_iter()
            .map(|l| {
                let (id, src, dst, params) = match l {
                    LinkJson::Record {
                        id,
                        src,
                        dst,
                        params,
                    } => (id, src, dst, params),
                    LinkJson::WithParams(src, dst, params) => (None, src, dst, params),
                    LinkJson::Bare(src, dst) => (None, src, dst, LinkParamsJson::default()),
                };

                let id = id.unwrap_or_else(|| {
                    let count = pair_counts.entry((src.clone(), dst.clone())).or_default();
                    *count += 1;
                    if *count == 1 {
                        format!("{src}-{dst}")
                    } else {
                        format!("{src}-{dst}-{count}")
                    }
                });

                Link {
                    id: id.into(),
                    src: src.into(),
                    dst: dst.into(),
                    params: params.into(),
                }
            })
            .collect();

        Topology {
            name: self.name,
            nodes,
            links,
            ingress: self.mp_ingress.map(|i| i.into()),
            metadata: self.metadata,
        }
    }
}

impl From<LinkParamsJson> for LinkParams {
    fn from(p: LinkParamsJson) -> Self {
        let shaping = if p.use_tbf || !p.use_htb {
            Shaping::Tbf
        } else {
            Shaping::Htb
        };

        LinkParams {
            bandwidth: p.bw,
            delay: p.delay,
            loss: p.loss,
            jitter: p.jitter,
            max_queue_size: p.max_queue_size,
            shaping,
        }
    }
}

impl From<IngressJson> for IngressConfig {
    fn from(i: IngressJson) -> Self {
        IngressConfig {
            kind: match i.kind {
                IngressKindJson::Wireguard => IngressKind::Wireguard,
                IngressKindJson::Openvpn => IngressKind::Openvpn,
                IngressKindJson::Gre => IngressKind::Gre,
            },
            assign: i
                .assign
                .into_iter()
                .map(|a| IngressAssignment {
                    mp_id: a.mp_id,
                    attach_to: Arc::from(a.attach_to),
                    vrf: a.vrf,
                    config: a.config,
                })
                .collect(),
        }
    }
}

impl From<ScenariosJson> for ScenarioSet {
    fn from(json: ScenariosJson) -> Self {
        let mut set = ScenarioSet::default();
        let records = json
            .persistent
            .into_iter()
            .map(|v| (ScenarioKind::Persistent, v))
            .chain(
                json.transient
                    .into_iter()
                    .map(|v| (ScenarioKind::Transient, v)),
            );

        for (kind, value) in records {
            let id = value
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string);

            match serde_json::from_value::<ScenarioJson>(value) {
                Ok(scenario) => {
                    let spec = scenario.into_spec(kind);
                    match kind {
                        ScenarioKind::Persistent => set.persistent.push(spec),
                        ScenarioKind::Transient => set.transient.push(spec),
                    }
                }
                Err(e) => set.rejected.push(RejectedScenario {
                    id,
                    kind,
                    reason: e.to_string(),
                }),
            }
        }

        set
    }
}

impl ScenarioJson {
    fn into_spec(self, kind: ScenarioKind) -> ScenarioSpec {
        let mut impairment = match self.impairments {
            Some(ImpairmentsJson::Composite(spec)) => spec,
            Some(ImpairmentsJson::Flat(netem)) => ImpairmentSpec::netem(netem),
            None => ImpairmentSpec::default(),
        };

        // Top-level keys take precedence over the nested `impairments` section
        if self.netem.is_some() {
            impairment.netem = self.netem;
        }
        if self.qdisc.is_some() {
            impairment.qdisc = self.qdisc;
        }

        ScenarioSpec {
            id: self.id.into(),
            kind,
            applies_to: self.applies_to,
            impairment,
            schedule: self.schedule,
            duration: self.duration.map(String::from),
            priority: self.priority,
            description: self.description,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    const DOCUMENT: &str = r#"
topology:
  name: small
  nodes:
    - { id: h1, type: host, services: [http] }
    - { id: r1, type: router, daemons: [ospf] }
    - { id: r2, type: router, asn: 65100, daemons: [bgp] }
    - { id: h2, type: host }
  links:
    - [h1, r1, { bw: 100m, delay: 5ms }]
    - [r1, r2]
    - [r1, r2, { loss: 0.5, use_tbf: true }]
    - { id: uplink, src: r2, dst: h2 }
  mp_ingress:
    type: gre
    assign:
      - { mp_id: mp1, attach_to: r1 }
scenarios:
  persistent:
    - id: baseline
      applies_to: "link:h1->r1"
      impairments: { delay: 10ms, loss: 1% }
  transient:
    - id: spike
      applies_to: "node:r2"
      netem: { loss: 5 }
      qdisc: { type: tbf, rate: 10m }
      schedule: "*/5 * * * *"
      duration: 90
    - id: broken
      applies_to: "node:r2"
      netem: { loss: "lots" }
"#;

    fn load() -> LoadedDocument {
        Document::from_yaml_str(DOCUMENT)
            .unwrap()
            .into_model(&CompilerConfig::default())
    }

    #[test]
    fn test_links_in_every_form() {
        let loaded = load();
        let links = &loaded.topology.links;

        let ids: Vec<_> = links.iter().map(|l| &*l.id).collect();
        assert_eq!(ids, ["h1-r1", "r1-r2", "r1-r2-2", "uplink"]);

        assert_eq!(links[0].params.bandwidth, Some(Bandwidth::from_mbps(100.0)));
        assert_eq!(
            links[0].params.delay.map(|d| d.0),
            Some(Duration::from_millis(5))
        );
        assert_eq!(links[0].params.shaping, Shaping::Htb);
        assert_eq!(links[2].params.shaping, Shaping::Tbf);
        assert_eq!(links[2].params.loss.map(|l| l.value()), Some(0.5));
    }

    #[test]
    fn test_routers_get_default_asn() {
        let loaded = load();
        let topology = &loaded.topology;

        assert_eq!(topology.node("r1").unwrap().asn, Some(65000));
        assert_eq!(topology.node("r2").unwrap().asn, Some(65100));
        assert_eq!(topology.node("h1").unwrap().asn, None);

        let without_default = Document::from_yaml_str(DOCUMENT)
            .unwrap()
            .into_model(&CompilerConfig { default_asn: None });
        assert_eq!(without_default.topology.node("r1").unwrap().asn, None);
    }

    #[test]
    fn test_ingress() {
        let loaded = load();
        let ingress = loaded.topology.ingress.unwrap();
        assert_eq!(ingress.kind, IngressKind::Gre);
        assert_eq!(&*ingress.assign[0].attach_to, "r1");
    }

    #[test]
    fn test_scenarios() {
        let loaded = load();
        let scenarios = &loaded.scenarios;

        let baseline = &scenarios.persistent[0];
        assert_eq!(baseline.kind, ScenarioKind::Persistent);
        assert_eq!(baseline.priority, 100);
        let netem = baseline.impairment.netem.as_ref().unwrap();
        assert_eq!(netem.tc_args(), ["delay", "10ms", "loss", "1%"]);

        let spike = &scenarios.transient[0];
        assert_eq!(spike.duration.as_deref(), Some("90"));
        assert!(spike.impairment.qdisc.is_some());
        assert_eq!(spike.active_duration().unwrap(), Duration::from_secs(90));

        assert_eq!(scenarios.rejected.len(), 1);
        assert_eq!(scenarios.rejected[0].id.as_deref(), Some("broken"));
    }

    #[test]
    fn test_json_document() {
        let json = r#"{
            "topology": {
                "name": "pair",
                "nodes": [{"id": "a", "type": "host"}, {"id": "b", "type": "host"}],
                "links": [["a", "b"]]
            }
        }"#;

        let loaded = Document::from_json_str(json)
            .unwrap()
            .into_model(&CompilerConfig::default());
        assert_eq!(loaded.topology.links.len(), 1);
        assert!(loaded.scenarios.is_empty());
    }

    #[test]
    fn test_malformed_link_tuple() {
        let json = r#"{
            "topology": {
                "name": "bad",
                "nodes": [{"id": "a", "type": "host"}],
                "links": [["a"]]
            }
        }"#;

        assert!(matches!(
            Document::from_json_str(json),
            Err(DocumentError::Json(_))
        ));
    }
}
