//! Shared wire schemas for the agent ↔ gateway ↔ controller protocol.
//!
//! All messages are UTF-8 JSON, one message per websocket frame, tagged by a
//! `type` discriminator. Field names on the wire are camelCase.

pub mod ids;
pub mod messages;

pub use ids::{new_command_id, now_ms, to_base36};
pub use messages::*;
