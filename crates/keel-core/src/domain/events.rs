//! Events - liveness の変化

use super::node::NodeIdentity;

/// Registry change observed through the coordination service's watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Added(NodeIdentity),
    Removed(NodeIdentity),
}

impl LivenessEvent {
    pub fn node(&self) -> &NodeIdentity {
        match self {
            LivenessEvent::Added(node) | LivenessEvent::Removed(node) => node,
        }
    }
}
