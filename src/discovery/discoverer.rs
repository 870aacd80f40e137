//! Reception and deduplication of host announcements.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::payload::{DiscoveredHost, HostAnnouncement};
use super::DiscoveryError;

/// Listens for `LANFORGE_HOST` datagrams and notifies a callback the first
/// time a `(ip, port)` pair is seen in the current discovery window. Later
/// datagrams from the same pair only refresh `last_seen`. Instance-owned:
/// `stop` closes the socket and clears the seen table; a second `start`
/// while running is a logged no-op.
#[derive(Debug, Default)]
pub struct Discoverer {
    task: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl Discoverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Bind `discovery_port` and begin receiving. Returns the bound port
    /// (useful when `discovery_port` is 0 in tests).
    pub async fn start<F>(
        &mut self,
        discovery_port: u16,
        on_host: F,
    ) -> Result<u16, DiscoveryError>
    where
        F: Fn(DiscoveredHost) + Send + 'static,
    {
        if self.task.is_some() {
            tracing::warn!("Discoverer already running; ignoring second start");
            return Ok(self.local_port.unwrap_or(discovery_port));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await?;
        let local_port = socket.local_addr()?.port();
        self.local_port = Some(local_port);
        tracing::info!("Listening for host announcements on udp port {}", local_port);

        self.task = Some(tokio::spawn(async move {
            let mut seen: HashMap<(IpAddr, u16), Instant> = HashMap::new();
            let mut buffer = [0u8; 512];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let Ok(text) = std::str::from_utf8(&buffer[..len]) else {
                            tracing::debug!("Ignoring non-UTF-8 datagram from {}", addr);
                            continue;
                        };
                        let Some(announcement) = HostAnnouncement::parse(text) else {
                            tracing::debug!("Ignoring unrecognized datagram from {}", addr);
                            continue;
                        };
                        let key = (addr.ip(), announcement.port);
                        let now = Instant::now();
                        if seen.insert(key, now).is_some() {
                            continue;
                        }
                        let host = DiscoveredHost {
                            ip: addr.ip(),
                            port: announcement.port,
                            room_id: announcement.room_id,
                            join_code: announcement.join_code,
                            host_client_id: announcement.host_client_id,
                            last_seen: now,
                        };
                        tracing::info!(
                            "Found room '{}' (code {}) at {}:{}",
                            host.room_id,
                            host.join_code,
                            host.ip,
                            host.port
                        );
                        on_host(host);
                    }
                    Err(e) => {
                        tracing::warn!("Error receiving announcement datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
        Ok(local_port)
    }

    /// Stop receiving, close the socket, and drop the seen table.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Discoverer stopped");
        }
        self.local_port = None;
    }
}

impl Drop for Discoverer {
    fn drop(&mut self) {
        self.stop();
    }
}
