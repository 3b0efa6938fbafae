//! The perception engine: materializes a page's interactive surface into a
//! stable, diff-able action-candidate set and maintains it under mutation.

pub mod candidate;
pub mod diff;
pub mod engine;
pub mod identity;
pub mod search;

pub use engine::{PerceptionEngine, DEBOUNCE, OBSERVED_ATTRIBUTES};
pub use identity::IdentityRegistry;
pub use search::{best_match, search};
