//! Link-local host announcement and discovery over UDP broadcast.

mod announcer;
mod discoverer;
mod payload;

use thiserror::Error;

pub use announcer::{ANNOUNCE_INTERVAL, Announcer};
pub use discoverer::Discoverer;
pub use payload::{ANNOUNCE_PREFIX, DISCOVERY_PORT, DiscoveredHost, HostAnnouncement};

/// Failure modes of the announcer/discoverer lifecycles.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// An announcement is missing its room id, join code, or host client id.
    #[error("announcement is missing required fields")]
    IncompleteAnnouncement,

    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}
