use crate::routing::Routes;
use crate::routing::address::AddressPlan;
use crate::topology::Topology;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A host route directive, as installed on the emulated node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteCommand {
    pub destination: Ipv4Addr,
    pub next_hop: Ipv4Addr,
}

impl Display for RouteCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ip route add {}/32 via {}", self.destination, self.next_hop)
    }
}

/// Switches reachable from `node` without crossing any non-switch node
fn switch_segment<'a>(topology: &'a Topology, node: &str) -> HashSet<&'a str> {
    let mut segment = HashSet::new();
    let mut queue: VecDeque<Arc<str>> = topology
        .neighbors(node)
        .into_iter()
        .filter(|n| topology.is_switch(n))
        .collect();

    while let Some(switch) = queue.pop_front() {
        let Some(known) = topology.node(&switch) else {
            continue;
        };
        if !segment.insert(&*known.id) {
            continue;
        }

        queue.extend(
            topology
                .neighbors(&switch)
                .into_iter()
                .filter(|n| topology.is_switch(n)),
        );
    }

    segment
}

/// The address of `next_hop` that `node` can reach directly: on a link they share or, failing
/// that, on a link from `next_hop` into the switch segment `node` is attached to
fn next_hop_address(
    topology: &Topology,
    plan: &AddressPlan,
    node: &str,
    next_hop: &str,
) -> Option<Ipv4Addr> {
    let on_link = |link_id: &str| {
        plan.for_link(link_id)
            .and_then(|assignment| assignment.address_of(next_hop))
    };

    if let Some(direct) = topology.link_between(node, next_hop) {
        return on_link(&direct.id);
    }

    let segment = switch_segment(topology, node);
    topology
        .links_of(next_hop)
        .filter(|link| {
            link.peer_of(next_hop)
                .is_some_and(|peer| segment.contains(&**peer))
        })
        .find_map(|link| on_link(&link.id))
}

/// Renders the routes of `node` as host route directives
///
/// Entries whose destination or next-hop address can't be determined are skipped.
pub fn generate_route_commands(
    topology: &Topology,
    node: &str,
    routes: &Routes,
    plan: &AddressPlan,
) -> Vec<RouteCommand> {
    routes
        .of(node)
        .iter()
        .filter_map(|route| {
            Some(RouteCommand {
                destination: plan.first_address(&route.destination)?,
                next_hop: next_hop_address(topology, plan, node, &route.next_hop)?,
            })
        })
        .collect()
}
