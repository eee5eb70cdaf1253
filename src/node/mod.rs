//! Node Module
//!
//! Identity of the three simulated nodes and the registry that tracks
//! their liveness and injected faults.

mod registry;

pub use registry::{NodeRegistry, NodeState, NodeStatus};

use serde::{Deserialize, Serialize};

/// One of the three nodes of the fragmented deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    /// Central node, authoritative for all records
    #[serde(rename = "master", alias = "central")]
    Master,
    /// Fragment owning records before the boundary
    #[serde(rename = "fragmentA", alias = "fragment_a")]
    FragmentA,
    /// Fragment owning records at/after the boundary
    #[serde(rename = "fragmentB", alias = "fragment_b")]
    FragmentB,
}

impl NodeId {
    /// All nodes in a stable order
    pub const ALL: [NodeId; 3] = [NodeId::Master, NodeId::FragmentA, NodeId::FragmentB];

    /// Both fragments
    pub const FRAGMENTS: [NodeId; 2] = [NodeId::FragmentA, NodeId::FragmentB];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Master => "master",
            NodeId::FragmentA => "fragmentA",
            NodeId::FragmentB => "fragmentB",
        }
    }

    /// Section name under `[nodes]` in the config file
    pub fn config_key(&self) -> &'static str {
        match self {
            NodeId::Master => "master",
            NodeId::FragmentA => "fragment_a",
            NodeId::FragmentB => "fragment_b",
        }
    }

    pub fn is_fragment(&self) -> bool {
        !matches!(self, NodeId::Master)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "master" | "central" => Ok(NodeId::Master),
            "fragmenta" => Ok(NodeId::FragmentA),
            "fragmentb" => Ok(NodeId::FragmentB),
            _ => Err(crate::Error::UnknownNode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parsing() {
        assert_eq!("master".parse::<NodeId>().unwrap(), NodeId::Master);
        assert_eq!("central".parse::<NodeId>().unwrap(), NodeId::Master);
        assert_eq!("fragmentA".parse::<NodeId>().unwrap(), NodeId::FragmentA);
        assert_eq!("fragment_b".parse::<NodeId>().unwrap(), NodeId::FragmentB);
        assert!("fragmentC".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_serde() {
        assert_eq!(serde_json::to_string(&NodeId::FragmentA).unwrap(), "\"fragmentA\"");
        let node: NodeId = serde_json::from_str("\"central\"").unwrap();
        assert_eq!(node, NodeId::Master);
    }
}
