//! Mutation journal records, drained by the agent's update loop and handed
//! to the perception engine's relevance filter.

use crate::dom::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// A subtree was attached under a connected parent.
    ChildAdded { node: NodeId },
    /// A subtree was detached. The node data is retained so identity
    /// survives a later re-attach.
    ChildRemoved { node: NodeId },
    /// An attribute changed value (or was removed).
    Attribute { node: NodeId, name: String },
    /// Text content changed.
    Text { node: NodeId },
}

impl Mutation {
    pub fn node(&self) -> NodeId {
        match self {
            Mutation::ChildAdded { node }
            | Mutation::ChildRemoved { node }
            | Mutation::Attribute { node, .. }
            | Mutation::Text { node } => *node,
        }
    }
}
