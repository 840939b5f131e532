//! Wire-level definitions shared by session clients.
//!
//! Endpoint paths, timing constants, connection state/event enums and the
//! host configuration document.

pub mod constants;
pub mod host_config;
pub mod state;

pub use host_config::HostConfig;
pub use state::{ConnectionState, Event};
