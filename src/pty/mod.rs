//! Interactive sessions: helper process bridge, command resolution and the
//! session registry.

pub mod bridge;
pub mod codec;
pub mod commands;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod writer;
