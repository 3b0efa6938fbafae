//! In-memory DOM mirror.
//!
//! The agent process does not run inside the page; it owns a mirror of the
//! page's element tree and operates on that. The mirror carries exactly what
//! perception and execution need: tags, attributes, text, geometry,
//! computed-style flags, focus, scroll offsets, a mutation journal, and a
//! journal of synthesized input events (forwarded to the browser's `Input`
//! domain by the agent binary). In tests the mirror is driven directly.

pub mod capture;
pub mod mutation;
pub mod tree;

pub use mutation::Mutation;
pub use tree::{Document, Element, NodeId, Style, SyntheticEvent};
