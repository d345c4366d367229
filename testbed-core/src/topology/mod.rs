//! Topology model: nodes, links and their parameters
//!
//! These are plain values. A [`Topology`] can be constructed in an inconsistent state (e.g. with
//! dangling link endpoints), because [`compiler::validate`] is responsible for reporting every
//! structural problem at once.

pub mod compiler;
pub mod document;
pub mod units;

use crate::topology::units::{Bandwidth, Percent, TimeSpan};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub const BGP_DAEMON: &str = "bgp";

pub const KNOWN_DAEMONS: [&str; 8] = [
    "ospf", "ospf6", "bgp", "isis", "rip", "ripng", "pimd", "ldpd",
];

pub const KNOWN_SERVICES: [&str; 8] = [
    "dns", "http", "https", "http2", "http3", "tcp_echo", "udp_echo", "cdn",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Switch,
    Router,
    Host,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            NodeKind::Switch => "switch",
            NodeKind::Router => "router",
            NodeKind::Host => "host",
        };
        f.write_str(kind)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Node {
    pub id: Arc<str>,
    pub kind: NodeKind,
    pub asn: Option<u32>,
    pub daemons: BTreeSet<String>,
    pub services: BTreeSet<String>,
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<Arc<str>>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            asn: None,
            daemons: BTreeSet::new(),
            services: BTreeSet::new(),
            config: serde_json::Map::new(),
        }
    }

    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }

    pub fn speaks_bgp(&self) -> bool {
        self.daemons.contains(BGP_DAEMON)
    }
}

/// The traffic shaping algorithm the emulation driver should use for a link's bandwidth limit
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Shaping {
    #[default]
    Htb,
    Tbf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LinkParams {
    pub bandwidth: Option<Bandwidth>,
    pub delay: Option<TimeSpan>,
    pub loss: Option<Percent>,
    pub jitter: Option<TimeSpan>,
    pub max_queue_size: Option<u32>,
    pub shaping: Shaping,
}

#[derive(Clone, Debug, Serialize)]
pub struct Link {
    pub id: Arc<str>,
    pub src: Arc<str>,
    pub dst: Arc<str>,
    pub params: LinkParams,
}

impl Link {
    pub fn new(src: impl Into<Arc<str>>, dst: impl Into<Arc<str>>) -> Self {
        let src = src.into();
        let dst = dst.into();
        Self {
            id: format!("{src}-{dst}").into(),
            src,
            dst,
            params: LinkParams::default(),
        }
    }

    pub fn touches(&self, node_id: &str) -> bool {
        &*self.src == node_id || &*self.dst == node_id
    }

    /// Returns the endpoint opposite to `node_id`, if the link touches it
    pub fn peer_of(&self, node_id: &str) -> Option<&Arc<str>> {
        if &*self.src == node_id {
            Some(&self.dst)
        } else if &*self.dst == node_id {
            Some(&self.src)
        } else {
            None
        }
    }

    /// Whether the link connects `a` and `b`, in any direction
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (&*self.src == a && &*self.dst == b) || (&*self.src == b && &*self.dst == a)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IngressKind {
    #[default]
    Wireguard,
    Openvpn,
    Gre,
}

/// A monitoring point attached to the topology through the ingress peer manager
#[derive(Clone, Debug, Serialize)]
pub struct IngressAssignment {
    pub mp_id: String,
    pub attach_to: Arc<str>,
    pub vrf: Option<String>,
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IngressConfig {
    pub kind: IngressKind,
    pub assign: Vec<IngressAssignment>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Topology {
    pub name: String,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub ingress: Option<IngressConfig>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Topology {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, links: Vec<Link>) -> Self {
        Self {
            name: name.into(),
            nodes,
            links,
            ingress: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| &*n.id == id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn links_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.touches(node_id))
    }

    /// Neighbors of a node, in link order and without duplicates
    pub fn neighbors(&self, node_id: &str) -> Vec<Arc<str>> {
        let mut neighbors: Vec<Arc<str>> = Vec::new();
        for link in self.links_of(node_id) {
            if let Some(peer) = link.peer_of(node_id) {
                if !neighbors.contains(peer) {
                    neighbors.push(peer.clone());
                }
            }
        }

        neighbors
    }

    /// The first link connecting `a` and `b`, regardless of its declared direction
    pub fn link_between(&self, a: &str, b: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.connects(a, b))
    }

    pub fn is_switch(&self, node_id: &str) -> bool {
        self.node(node_id).is_some_and(Node::is_switch)
    }
}
