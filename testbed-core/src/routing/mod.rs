//! Static routing: next hops between non-switch nodes, link addressing and the host-level route
//! directives derived from both

pub mod address;
pub mod commands;

use crate::topology::Topology;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub destination: Arc<str>,
    pub next_hop: Arc<str>,
}

/// Forwarding tables of every non-switch node, keyed by source node
#[derive(Clone, Debug, Default, Serialize)]
pub struct Routes {
    tables: BTreeMap<Arc<str>, Vec<RouteEntry>>,
}

impl Routes {
    /// The routes of `node`, ordered like the topology's nodes
    pub fn of(&self, node: &str) -> &[RouteEntry] {
        self.tables.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn next_hop(&self, src: &str, destination: &str) -> Option<&Arc<str>> {
        self.of(src)
            .iter()
            .find(|r| &*r.destination == destination)
            .map(|r| &r.next_hop)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &[RouteEntry])> {
        self.tables.iter().map(|(node, routes)| (node, routes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Undirected adjacency lists with neighbors in link input order
fn adjacency(topology: &Topology) -> HashMap<&str, Vec<&Arc<str>>> {
    let mut adjacency: HashMap<&str, Vec<&Arc<str>>> = HashMap::new();
    for link in &topology.links {
        if !topology.has_node(&link.src) || !topology.has_node(&link.dst) {
            continue;
        }

        for (from, to) in [(&link.src, &link.dst), (&link.dst, &link.src)] {
            let neighbors = adjacency.entry(&**from).or_default();
            if !neighbors.contains(&to) {
                neighbors.push(to);
            }
        }
    }

    adjacency
}

/// Computes shortest-path (hop count) routes between every pair of non-switch nodes
///
/// Switches are transparent: they never appear as a destination or next hop, and a path that
/// crosses them uses the first non-switch node after the source as its next hop. Ties are broken
/// by link order, which makes the result deterministic.
pub fn compute_routes(topology: &Topology) -> Routes {
    let adjacency = adjacency(topology);
    let mut tables = BTreeMap::new();

    for source in topology.nodes.iter().filter(|n| !n.is_switch()) {
        // Breadth-first search, remembering how each node was reached
        let mut parents: HashMap<&str, &Arc<str>> = HashMap::new();
        let mut queue = VecDeque::from([&source.id]);
        while let Some(current) = queue.pop_front() {
            for &neighbor in adjacency.get(&**current).into_iter().flatten() {
                if neighbor != &source.id && !parents.contains_key(&**neighbor) {
                    parents.insert(&**neighbor, current);
                    queue.push_back(neighbor);
                }
            }
        }

        let mut routes = Vec::new();
        for destination in topology.nodes.iter().filter(|n| !n.is_switch()) {
            if destination.id == source.id || !parents.contains_key(&*destination.id) {
                continue;
            }

            // Walk back to the source, keeping the non-switch node closest to it
            let mut next_hop = &destination.id;
            let mut current = &destination.id;
            while let Some(&parent) = parents.get(&**current) {
                if !topology.is_switch(current) {
                    next_hop = current;
                }
                current = parent;
            }

            routes.push(RouteEntry {
                destination: destination.id.clone(),
                next_hop: next_hop.clone(),
            });
        }

        tables.insert(source.id.clone(), routes);
    }

    Routes { tables }
}
