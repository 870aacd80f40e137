//! The announcement datagram format.
//!
//! A single ASCII datagram: `LANFORGE_HOST <roomId> <joinCode> <hostClientId>
//! <port>`. The announcer's IP is not carried in the payload; receivers take
//! it from the datagram's source address.

use std::net::IpAddr;
use std::time::Instant;

/// Well-known UDP port announcements are sent to.
pub const DISCOVERY_PORT: u16 = 42069;
/// First token of every announcement datagram.
pub const ANNOUNCE_PREFIX: &str = "LANFORGE_HOST";

/// The content of one announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAnnouncement {
    pub room_id: String,
    pub join_code: String,
    pub host_client_id: String,
    /// The coordinator's WebSocket port on the announcing device.
    pub port: u16,
}

impl HostAnnouncement {
    /// True when every identifying field is non-empty.
    pub fn is_complete(&self) -> bool {
        !self.room_id.is_empty() && !self.join_code.is_empty() && !self.host_client_id.is_empty()
    }

    /// Render the datagram payload.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {}\n",
            ANNOUNCE_PREFIX, self.room_id, self.join_code, self.host_client_id, self.port
        )
    }

    /// Parse a datagram payload; `None` when the prefix differs, fields are
    /// missing, or the port does not parse.
    pub fn parse(payload: &str) -> Option<HostAnnouncement> {
        let mut fields = payload.split_whitespace();
        if fields.next()? != ANNOUNCE_PREFIX {
            return None;
        }
        let room_id = fields.next()?.to_string();
        let join_code = fields.next()?.to_string();
        let host_client_id = fields.next()?.to_string();
        let port: u16 = fields.next()?.parse().ok()?;
        Some(HostAnnouncement {
            room_id,
            join_code,
            host_client_id,
            port,
        })
    }
}

/// A coordinator observed on the link during one discovery window.
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
    pub ip: IpAddr,
    pub port: u16,
    pub room_id: String,
    pub join_code: String,
    pub host_client_id: String,
    pub last_seen: Instant,
}

impl DiscoveredHost {
    /// The WebSocket URL to reconnect to this coordinator.
    pub fn server_url(&self) -> String {
        format!("ws://{}:{}/ws", self.ip, self.port)
    }
}
