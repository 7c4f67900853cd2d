//! Batch task orchestration.
//!
//! Covers request shapes, command-line construction, child supervision,
//! output interpretation and heartbeat logging.

pub mod args;
pub mod artifacts;
pub mod engine;
pub mod heartbeat;
pub mod output;
pub mod request;
pub mod stream;

pub use engine::TaskEngine;
