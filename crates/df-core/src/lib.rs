//! df-core: shared ids, errors, configuration, and the lifecycle event bus.
//!
//! Every other df-* crate depends on this one. It deliberately knows nothing
//! about flows or content; it only carries the vocabulary they share.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
