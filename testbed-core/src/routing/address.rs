use crate::topology::Topology;
use anyhow::{Context, anyhow, bail};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const LAN_PREFIX: u8 = 24;
const POINT_TO_POINT_PREFIX: u8 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub network_prefix: u8,
}

impl Ipv4Cidr {
    fn mask(&self) -> u32 {
        u32::MAX
            .checked_shl(32 - u32::from(self.network_prefix))
            .unwrap_or(0)
    }

    /// First address of the network
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() & self.mask())
    }

    /// Last address of the network
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.network()..=self.broadcast()).contains(&ip)
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.network_prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let base_ip: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .context("invalid ip address in address pool")?;

        let IpAddr::V4(base_ip) = base_ip else {
            bail!("only IPv4 address pools are supported");
        };

        // A missing network prefix is interpreted as /32 (i.e. a single address)
        let network_prefix: u8 = parts
            .next()
            .unwrap_or("32")
            .parse()
            .context("the provided network prefix is not a valid unsigned integer")?;
        if network_prefix == 0 {
            bail!("network prefix cannot be 0");
        }
        if network_prefix > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        if parts.next().is_some() {
            bail!("address pool contains trailing characters");
        }

        Ok(Self {
            address: base_ip,
            network_prefix,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("address pool `{pool}` has no room left for link `{link}` (needs a /{prefix_len})")]
pub struct AddressPoolExhausted {
    pub pool: Ipv4Cidr,
    pub link: Arc<str>,
    pub prefix_len: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddressAssignment {
    pub link_id: Arc<str>,
    pub src_node: Arc<str>,
    pub dst_node: Arc<str>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl AddressAssignment {
    /// The address `node` holds on this link
    pub fn address_of(&self, node: &str) -> Option<Ipv4Addr> {
        if &*self.src_node == node {
            Some(self.src_ip)
        } else if &*self.dst_node == node {
            Some(self.dst_ip)
        } else {
            None
        }
    }

    /// The block carved for this link
    pub fn block(&self) -> Ipv4Cidr {
        let block = Ipv4Cidr {
            address: self.src_ip,
            network_prefix: self.prefix_len,
        };
        Ipv4Cidr {
            address: block.network(),
            network_prefix: self.prefix_len,
        }
    }
}

/// Per-link address blocks, in link order
#[derive(Clone, Debug, Serialize)]
pub struct AddressPlan {
    pub assignments: Vec<AddressAssignment>,
}

impl AddressPlan {
    pub fn for_link(&self, link_id: &str) -> Option<&AddressAssignment> {
        self.assignments.iter().find(|a| &*a.link_id == link_id)
    }

    /// The first address assigned to `node`, in link order
    pub fn first_address(&self, node: &str) -> Option<Ipv4Addr> {
        self.assignments.iter().find_map(|a| a.address_of(node))
    }
}

/// Carves one block per link out of `pool`
///
/// Links touching a switch get a /24, links between two non-switch nodes get a /30. /24 blocks
/// are taken from the bottom of the pool and /30 blocks from the top, so the two kinds can never
/// overlap. Running out of room is an error; nothing is partially assigned.
pub fn assign_addresses(
    topology: &Topology,
    pool: &Ipv4Cidr,
) -> Result<AddressPlan, AddressPoolExhausted> {
    let pool_start = u64::from(pool.network().to_bits());
    let pool_end = u64::from(pool.broadcast().to_bits()) + 1;

    // Next free address for LAN blocks, growing upwards
    let mut lan_cursor = pool_start;
    // End (exclusive) of the free space for point-to-point blocks, growing downwards
    let mut p2p_cursor = pool_end;

    let mut assignments = Vec::with_capacity(topology.links.len());
    for link in &topology.links {
        let switch_adjacent = topology.is_switch(&link.src) || topology.is_switch(&link.dst);
        let prefix_len = if switch_adjacent {
            LAN_PREFIX
        } else {
            POINT_TO_POINT_PREFIX
        };
        let block_size = 1u64 << (32 - prefix_len);

        let exhausted = || AddressPoolExhausted {
            pool: *pool,
            link: link.id.clone(),
            prefix_len,
        };

        let block_start = if switch_adjacent {
            let start = lan_cursor.next_multiple_of(block_size);
            if start + block_size > p2p_cursor {
                return Err(exhausted());
            }
            lan_cursor = start + block_size;
            start
        } else {
            let start = p2p_cursor
                .checked_sub(block_size)
                .map(|s| s - s % block_size)
                .filter(|&s| s >= lan_cursor)
                .ok_or_else(exhausted)?;
            p2p_cursor = start;
            start
        };

        // `block_start` lies within the pool, so it fits in 32 bits
        let block_start = block_start as u32;
        assignments.push(AddressAssignment {
            link_id: link.id.clone(),
            src_node: link.src.clone(),
            dst_node: link.dst.clone(),
            src_ip: Ipv4Addr::from_bits(block_start + 1),
            dst_ip: Ipv4Addr::from_bits(block_start + 2),
            prefix_len,
        });
    }

    Ok(AddressPlan { assignments })
}
