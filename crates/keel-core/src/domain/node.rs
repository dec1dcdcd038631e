//! Node identities (gateway and runtime workers).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Gate,
    Runtime,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Gate => f.write_str("gate"),
            NodeKind::Runtime => f.write_str("runtime"),
        }
    }
}

/// Who a process is, re-derived at every start and never persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub kind: NodeKind,
    pub name_prefix: String,
    pub name: String,
    pub address: String,
}

impl NodeIdentity {
    pub fn new(
        kind: NodeKind,
        name_prefix: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name_prefix: name_prefix.into(),
            name: name.into(),
            address: address.into(),
        }
    }

    /// Rebuilds an identity from a registry key. The prefix cannot be split back
    /// out of the key, so the whole key becomes the name.
    pub fn from_key(kind: NodeKind, key: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(kind, "", key, address)
    }

    /// `namePrefix-name`, or just `name` without a prefix.
    pub fn key(&self) -> String {
        if self.name_prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name_prefix, self.name)
        }
    }

    pub fn path(&self) -> String {
        keys::node_path(self.kind, &self.key())
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_prefix_and_name() {
        let id = NodeIdentity::new(NodeKind::Runtime, "pool", "w1", "10.0.0.1:7000");
        assert_eq!(id.key(), "pool-w1");
        assert_eq!(id.path(), "/scheduler/runtime/node/pool-w1");
        assert_eq!(id.to_string(), "runtime/pool-w1");
    }

    #[test]
    fn empty_prefix_uses_bare_name() {
        let id = NodeIdentity::new(NodeKind::Gate, "", "g1", "");
        assert_eq!(id.key(), "g1");
        assert_eq!(
            NodeIdentity::from_key(NodeKind::Gate, "g1", "").path(),
            id.path()
        );
    }
}
