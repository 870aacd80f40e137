//! Periodic broadcast of the local coordinator's presence.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::payload::HostAnnouncement;
use super::DiscoveryError;

/// How often an active announcer broadcasts.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3);

/// Broadcasts `LANFORGE_HOST` datagrams while the local coordinator is
/// active. Instance-owned: `start` spawns the ticking task, `stop` tears it
/// down and closes the socket. At most one announce task runs per instance;
/// a second `start` is a logged no-op.
#[derive(Debug, Default)]
pub struct Announcer {
    task: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Begin broadcasting `announcement` to the subnet broadcast address on
    /// `discovery_port` every [`ANNOUNCE_INTERVAL`].
    ///
    /// Refuses incomplete announcements. Transient send errors inside the
    /// task are logged and the ticking continues.
    pub async fn start(
        &mut self,
        announcement: HostAnnouncement,
        discovery_port: u16,
    ) -> Result<(), DiscoveryError> {
        if self.task.is_some() {
            tracing::warn!("Announcer already running; ignoring second start");
            return Ok(());
        }
        if !announcement.is_complete() {
            return Err(DiscoveryError::IncompleteAnnouncement);
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, discovery_port));
        let datagram = announcement.encode();

        tracing::info!(
            "Announcing room '{}' (code {}) on udp broadcast port {}",
            announcement.room_id,
            announcement.join_code,
            discovery_port
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(datagram.as_bytes(), target).await {
                    tracing::warn!("Failed to send announcement: {}", e);
                }
            }
        }));
        Ok(())
    }

    /// Stop broadcasting and release the socket.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Announcer stopped");
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}
