use crate::topology::Topology;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetResolutionError {
    #[error("malformed target `{0}` (expected `link:A->B`, `path:A->B->...` or `node:A`)")]
    Malformed(String),
    #[error("target references unknown node `{0}`")]
    UnknownNode(Arc<str>),
    #[error("there is no link between `{src}` and `{dst}`")]
    UnknownLink { src: Arc<str>, dst: Arc<str> },
}

/// Where a scenario's impairment is enforced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// The interface of `src` facing `dst`
    Link { src: Arc<str>, dst: Arc<str> },
    /// The outgoing interface of every hop along the path
    Path(Vec<Arc<str>>),
    /// Every interface of the node
    Node(Arc<str>),
}

impl FromStr for Target {
    type Err = TargetResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TargetResolutionError::Malformed(s.to_string());
        let (kind, rest) = s.trim().split_once(':').ok_or_else(malformed)?;

        let hops: Vec<Arc<str>> = rest.split("->").map(|hop| Arc::from(hop.trim())).collect();
        if hops.iter().any(|hop| hop.is_empty()) {
            return Err(malformed());
        }

        match (kind.trim(), hops.as_slice()) {
            ("link", [src, dst]) => Ok(Target::Link {
                src: src.clone(),
                dst: dst.clone(),
            }),
            ("path", [_, _, ..]) => Ok(Target::Path(hops)),
            ("node", [node]) => Ok(Target::Node(node.clone())),
            _ => Err(malformed()),
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Link { src, dst } => write!(f, "link:{src}->{dst}"),
            Target::Path(hops) => write!(f, "path:{}", hops.join("->")),
            Target::Node(node) => write!(f, "node:{node}"),
        }
    }
}

impl Target {
    /// Resolves the target into `(node, peer)` pairs, each identifying the interface of `node`
    /// that faces `peer`
    pub fn interface_pairs(
        &self,
        topology: &Topology,
    ) -> Result<Vec<(Arc<str>, Arc<str>)>, TargetResolutionError> {
        let check_node = |node: &Arc<str>| {
            if topology.has_node(node) {
                Ok(())
            } else {
                Err(TargetResolutionError::UnknownNode(node.clone()))
            }
        };

        let check_link = |src: &Arc<str>, dst: &Arc<str>| {
            check_node(src)?;
            check_node(dst)?;
            match topology.link_between(src, dst) {
                Some(_) => Ok((src.clone(), dst.clone())),
                None => Err(TargetResolutionError::UnknownLink {
                    src: src.clone(),
                    dst: dst.clone(),
                }),
            }
        };

        match self {
            Target::Link { src, dst } => Ok(vec![check_link(src, dst)?]),
            Target::Path(hops) => hops
                .windows(2)
                .map(|pair| check_link(&pair[0], &pair[1]))
                .collect(),
            Target::Node(node) => {
                check_node(node)?;
                Ok(topology
                    .neighbors(node)
                    .into_iter()
                    .map(|peer| (node.clone(), peer))
                    .collect())
            }
        }
    }
}
