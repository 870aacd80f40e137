//! The coordinator: the single process serving the authoritative room state
//! over WebSocket.
//!
//! Socket tasks are producers only; every mutation of the room registry and
//! the connection table happens on one serialized event loop, so none of the
//! state needs a lock.

mod handler;
mod runner;
mod state;

use std::time::Duration;

pub use runner::{CoordinatorHandle, start_coordinator};

/// Well-known coordinator port.
pub const COORDINATOR_PORT: u16 = 8080;
/// How often the coordinator pings its connections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Silence after which a connection is closed.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
