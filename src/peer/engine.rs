//! The peer engine event loop and migration state machine.
//!
//! All mutable peer state (connection, snapshot cache, migration flag) is
//! owned by one task; commands from the UI and events from the I/O drivers
//! are serialized through its channels.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::common::identity;
use crate::common::time;
use crate::coordinator::{COORDINATOR_PORT, CoordinatorHandle, start_coordinator};
use crate::discovery::{
    Announcer, DISCOVERY_PORT, DiscoveredHost, Discoverer, HostAnnouncement,
};
use crate::protocol::{Frame, FrameBody, PENDING_CLIENT_ID};
use crate::room::{Snapshot, migrate_snapshot, plan_succession};

use super::connection::{self, ActiveConnection, PeerEvent};

/// How long Awaiting-Host listens before the sole-survivor fallback.
pub const MIGRATION_WAIT: Duration = Duration::from_secs(10);

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Peer engine configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Stable device identity.
    pub device_id: String,
    /// Display name.
    pub name: String,
    /// Coordinator URL for the initial connection.
    pub server_url: String,
    /// Port to bind when this peer hosts a coordinator (0 = ephemeral).
    pub coordinator_port: u16,
    /// UDP port for announcements and discovery.
    pub discovery_port: u16,
    /// Awaiting-Host window before the sole-survivor fallback.
    pub migration_wait: Duration,
}

impl PeerConfig {
    pub fn new(device_id: String, name: String) -> Self {
        Self {
            device_id,
            name,
            server_url: identity::server_url(),
            coordinator_port: COORDINATOR_PORT,
            discovery_port: DISCOVERY_PORT,
            migration_wait: MIGRATION_WAIT,
        }
    }
}

/// Commands from the UI into the engine.
#[derive(Debug)]
pub enum PeerCommand {
    /// Connect to the configured coordinator URL.
    Start,
    /// Start a local coordinator, connect to it, and create a room.
    HostRoom { room_name: Option<String> },
    /// Create a room on the coordinator this peer is already connected to.
    CreateRoom { room_name: Option<String> },
    JoinRoom { join_code: String },
    SendChat { text: String },
    Kick { target_device_id: String },
    LeaveRoom,
    Shutdown,
}

/// What the engine surfaces to the UI.
#[derive(Debug)]
pub enum PeerNotification {
    Connected { url: String },
    Welcome { client_id: String },
    Snapshot(Snapshot),
    Chat {
        from_name: String,
        text: String,
        timestamp: i64,
    },
    ServerError { reason: String },
    Kicked { reason: String },
    /// This peer now runs the coordinator at `addr`.
    Hosting { addr: SocketAddr },
    /// Terminal: the session cannot continue.
    SessionEnded { reason: String },
}

/// Handle for driving a spawned engine.
#[derive(Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn start(&self) {
        self.send(PeerCommand::Start);
    }

    pub fn host_room(&self, room_name: Option<String>) {
        self.send(PeerCommand::HostRoom { room_name });
    }

    pub fn create_room(&self, room_name: Option<String>) {
        self.send(PeerCommand::CreateRoom { room_name });
    }

    pub fn join_room(&self, join_code: String) {
        self.send(PeerCommand::JoinRoom { join_code });
    }

    pub fn send_chat(&self, text: String) {
        self.send(PeerCommand::SendChat { text });
    }

    pub fn kick(&self, target_device_id: String) {
        self.send(PeerCommand::Kick { target_device_id });
    }

    pub fn leave_room(&self) {
        self.send(PeerCommand::LeaveRoom);
    }

    pub fn shutdown(&self) {
        self.send(PeerCommand::Shutdown);
    }

    fn send(&self, command: PeerCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Peer engine is gone; dropping command");
        }
    }
}

/// The engine itself. Construct with [`PeerEngine::spawn`].
pub struct PeerEngine {
    cfg: PeerConfig,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    notifications: mpsc::UnboundedSender<PeerNotification>,
    conn: Option<ActiveConnection>,
    conn_seq: u64,
    client_id: Option<String>,
    snapshot: Option<Snapshot>,
    is_handling_loss: bool,
    migration_generation: u64,
    announcer: Announcer,
    current_announcement: Option<HostAnnouncement>,
    discoverer: Discoverer,
    coordinator: Option<CoordinatorHandle>,
    next_request: u64,
}

impl PeerEngine {
    /// Spawn the engine task. UI notifications go to `notifications`; the
    /// returned handle feeds it commands.
    pub fn spawn(
        cfg: PeerConfig,
        notifications: mpsc::UnboundedSender<PeerNotification>,
    ) -> PeerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = PeerEngine {
            cfg,
            events_tx,
            notifications,
            conn: None,
            conn_seq: 0,
            client_id: None,
            snapshot: None,
            is_handling_loss: false,
            migration_generation: 0,
            announcer: Announcer::new(),
            current_announcement: None,
            discoverer: Discoverer::new(),
            coordinator: None,
            next_request: 0,
        };
        tokio::spawn(engine.run(commands_rx, events_rx));
        PeerHandle {
            commands: commands_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PeerCommand::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Start => {
                let url = self.cfg.server_url.clone();
                self.connect_to(&url).await;
            }
            PeerCommand::HostRoom { room_name } => {
                self.host_room(room_name).await;
            }
            PeerCommand::CreateRoom { room_name } => {
                self.send_frame(FrameBody::CreateRoom {
                    room_name,
                    max_players: None,
                });
            }
            PeerCommand::JoinRoom { join_code } => {
                self.send_frame(FrameBody::JoinRoom { join_code });
            }
            PeerCommand::SendChat { text } => {
                self.send_frame(FrameBody::Chat { text });
            }
            PeerCommand::Kick { target_device_id } => {
                self.send_frame(FrameBody::Kick { target_device_id });
            }
            PeerCommand::LeaveRoom => {
                self.send_frame(FrameBody::LeaveRoom);
            }
            PeerCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::FrameReceived { conn, frame } => {
                if self.conn.as_ref().map(|c| c.id) != Some(conn) {
                    tracing::debug!("Dropping frame from a replaced connection");
                    return;
                }
                self.handle_frame(frame).await;
            }
            PeerEvent::ConnectionClosed { conn } => {
                let Some(active) = &self.conn else {
                    tracing::debug!("Ignoring close of a replaced connection");
                    return;
                };
                if active.id != conn {
                    tracing::debug!("Ignoring close of a replaced connection");
                    return;
                }
                tracing::warn!("Connection to {} lost", active.url);
                self.handle_server_lost().await;
            }
            PeerEvent::HostFound(host) => {
                self.handle_host_found(host).await;
            }
            PeerEvent::MigrationTimeout { generation } => {
                self.handle_migration_timeout(generation).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.body {
            FrameBody::Welcome { client_id } => {
                tracing::info!("Assigned client id '{}'", client_id);
                self.client_id = Some(client_id.clone());
                let _ = self
                    .notifications
                    .send(PeerNotification::Welcome { client_id });
                self.sync_announcer().await;
            }
            FrameBody::StateSnapshot { snapshot } => {
                tracing::debug!(
                    "Snapshot for room '{}': {} members, {} chat entries",
                    snapshot.room.room_id,
                    snapshot.room.members.len(),
                    snapshot.room.chat.len()
                );
                self.snapshot = Some(snapshot.clone());
                self.sync_announcer().await;
                let _ = self.notifications.send(PeerNotification::Snapshot(snapshot));
            }
            FrameBody::ChatBroadcast {
                from_name,
                text,
                timestamp,
                ..
            } => {
                let _ = self.notifications.send(PeerNotification::Chat {
                    from_name,
                    text,
                    timestamp,
                });
            }
            FrameBody::Ping { .. } => {
                self.send_frame(FrameBody::Pong {
                    timestamp: time::now_millis(),
                });
            }
            FrameBody::Pong { .. } => {}
            FrameBody::Error { reason, .. } => {
                tracing::warn!("Coordinator error: {}", reason);
                let _ = self
                    .notifications
                    .send(PeerNotification::ServerError { reason });
            }
            FrameBody::Kicked { reason } => {
                tracing::warn!("Kicked from room: {}", reason);
                let _ = self
                    .notifications
                    .send(PeerNotification::Kicked { reason });
                // The coordinator will close us anyway; run the loss path so
                // this peer continues the room on its own (AP divergence).
                self.handle_server_lost().await;
            }
            other => {
                tracing::debug!("Ignoring unexpected frame type {}", other.kind());
            }
        }
    }

    /// The migration state machine entry point (ServerLost).
    ///
    /// `is_handling_loss` makes re-entry a no-op: the transport layer may
    /// report both a close and an error for the same disconnect.
    async fn handle_server_lost(&mut self) {
        if self.is_handling_loss {
            tracing::debug!("Already handling server loss");
            return;
        }
        self.is_handling_loss = true;
        self.teardown_conn();
        self.announcer.stop();
        self.current_announcement = None;
        if let Some(handle) = self.coordinator.take() {
            // Our own coordinator died with the connection; release the port.
            handle.stop().await;
        }

        let Some(snapshot) = self.snapshot.clone() else {
            tracing::error!("MIGRATION_ABANDONED: no cached snapshot");
            let _ = self.notifications.send(PeerNotification::SessionEnded {
                reason: "migration abandoned: no replicated room state".to_string(),
            });
            return;
        };
        if self.client_id.is_none() {
            tracing::error!("MIGRATION_ABANDONED: never received a client id");
            let _ = self.notifications.send(PeerNotification::SessionEnded {
                reason: "migration abandoned: connection identity never established".to_string(),
            });
            return;
        }

        let lost_host = snapshot.room.host_device_id.clone();
        match plan_succession(&snapshot, &lost_host) {
            None => {
                tracing::error!("MIGRATION_ABANDONED: no surviving members");
                let _ = self.notifications.send(PeerNotification::SessionEnded {
                    reason: "migration abandoned: no surviving members".to_string(),
                });
            }
            Some((winner, migrated)) => {
                tracing::info!(
                    "Election for room '{}' selected '{}'",
                    snapshot.room.room_id,
                    winner
                );
                if winner == self.cfg.device_id {
                    self.become_host(migrated).await;
                } else {
                    self.await_host(&winner).await;
                }
            }
        }
    }

    /// Becoming-Host: serve the migrated room locally, announce it, and
    /// rejoin as a client of our own coordinator over loopback.
    async fn become_host(&mut self, migrated: Snapshot) {
        self.discoverer.stop();
        tracing::info!(
            "Becoming host for room '{}' (code {})",
            migrated.room.room_id,
            migrated.room.join_code
        );
        match start_coordinator("0.0.0.0", self.cfg.coordinator_port, Some(migrated.clone())).await
        {
            Ok(handle) => {
                let port = handle.port();
                let _ = self.notifications.send(PeerNotification::Hosting {
                    addr: handle.local_addr(),
                });
                self.coordinator = Some(handle);
                self.snapshot = Some(migrated);
                self.sync_announcer().await;
                self.is_handling_loss = false;
                let url = format!("ws://127.0.0.1:{}/ws", port);
                self.connect_to(&url).await;
            }
            Err(e) => {
                tracing::error!("Failed to start coordinator: {}", e);
                let _ = self.notifications.send(PeerNotification::SessionEnded {
                    reason: format!("failed to start coordinator: {}", e),
                });
            }
        }
    }

    /// Awaiting-Host: listen for the winner's announcement, with a timer
    /// that falls back to hosting ourselves (sole-survivor policy).
    async fn await_host(&mut self, winner: &str) {
        tracing::info!(
            "Awaiting announcement from '{}' for up to {:?}",
            winner,
            self.cfg.migration_wait
        );
        let events = self.events_tx.clone();
        if let Err(e) = self
            .discoverer
            .start(self.cfg.discovery_port, move |host| {
                let _ = events.send(PeerEvent::HostFound(host));
            })
            .await
        {
            tracing::warn!("Could not start discoverer: {}", e);
        }

        self.migration_generation += 1;
        let generation = self.migration_generation;
        let events = self.events_tx.clone();
        let wait = self.cfg.migration_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(PeerEvent::MigrationTimeout { generation });
        });
    }

    async fn handle_host_found(&mut self, host: DiscoveredHost) {
        if !self.is_handling_loss {
            tracing::debug!("Ignoring discovered host outside migration");
            return;
        }
        if let Some(snapshot) = &self.snapshot
            && snapshot.room.room_id != host.room_id
        {
            tracing::debug!("Ignoring announcement for other room '{}'", host.room_id);
            return;
        }
        tracing::info!(
            "Rediscovered room '{}' at {}:{}; reconnecting",
            host.room_id,
            host.ip,
            host.port
        );
        self.discoverer.stop();
        // Invalidate the armed Awaiting-Host timer.
        self.migration_generation += 1;
        self.is_handling_loss = false;
        let url = host.server_url();
        self.connect_to(&url).await;
    }

    async fn handle_migration_timeout(&mut self, generation: u64) {
        if generation != self.migration_generation || !self.is_handling_loss {
            tracing::debug!("Ignoring stale migration timer");
            return;
        }
        tracing::warn!(
            "No matching host announced within {:?}; becoming host (sole survivor)",
            self.cfg.migration_wait
        );
        self.discoverer.stop();
        let Some(snapshot) = self.snapshot.clone() else {
            let _ = self.notifications.send(PeerNotification::SessionEnded {
                reason: "migration abandoned: no replicated room state".to_string(),
            });
            return;
        };
        let lost_host = snapshot.room.host_device_id.clone();
        match migrate_snapshot(&snapshot, &lost_host, &self.cfg.device_id) {
            Some(migrated) => self.become_host(migrated).await,
            None => {
                tracing::error!("Cannot continue the room: this device is not in the snapshot");
                let _ = self.notifications.send(PeerNotification::SessionEnded {
                    reason: "migration abandoned: device absent from the snapshot".to_string(),
                });
            }
        }
    }

    async fn host_room(&mut self, room_name: Option<String>) {
        if self.coordinator.is_some() {
            tracing::warn!("Already hosting a coordinator; ignoring host request");
            return;
        }
        match start_coordinator("0.0.0.0", self.cfg.coordinator_port, None).await {
            Ok(handle) => {
                let port = handle.port();
                let _ = self.notifications.send(PeerNotification::Hosting {
                    addr: handle.local_addr(),
                });
                self.coordinator = Some(handle);
                let url = format!("ws://127.0.0.1:{}/ws", port);
                if self.connect_to(&url).await {
                    self.send_frame(FrameBody::CreateRoom {
                        room_name,
                        max_players: None,
                    });
                }
            }
            Err(e) => {
                tracing::error!("Failed to start coordinator: {}", e);
                let _ = self.notifications.send(PeerNotification::SessionEnded {
                    reason: format!("failed to start coordinator: {}", e),
                });
            }
        }
    }

    /// Replace the current connection with one to `url` and HELLO on it.
    async fn connect_to(&mut self, url: &str) -> bool {
        self.teardown_conn();
        self.conn_seq += 1;
        let conn_id = self.conn_seq;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match connection::open(url, conn_id, self.events_tx.clone()).await {
                Ok(conn) => {
                    tracing::info!("Connected to {}", url);
                    self.conn = Some(conn);
                    self.send_frame(FrameBody::Hello {
                        device_id: self.cfg.device_id.clone(),
                        name: self.cfg.name.clone(),
                    });
                    let _ = self.notifications.send(PeerNotification::Connected {
                        url: url.to_string(),
                    });
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        MAX_CONNECT_ATTEMPTS,
                        url,
                        e
                    );
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                    }
                }
            }
        }
        let _ = self.notifications.send(PeerNotification::SessionEnded {
            reason: format!("could not connect to {}", url),
        });
        false
    }

    /// Queue a frame on the open connection; warn and drop otherwise.
    ///
    /// At-most-once at the operation level: durability comes from the
    /// replicated snapshot, not from retries.
    fn send_frame(&mut self, body: FrameBody) {
        let kind = body.kind();
        let Some(conn) = &self.conn else {
            tracing::warn!("Transport not open; dropping {} frame", kind);
            return;
        };
        self.next_request += 1;
        let frame = Frame {
            request_id: format!("req-{}", self.next_request),
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| PENDING_CLIENT_ID.to_string()),
            body,
        };
        if !conn.send(frame.encode()) {
            tracing::warn!("Outbound queue closed; dropping {} frame", kind);
        }
    }

    /// The announcement this peer should currently be broadcasting, if any:
    /// it is the elected host of the cached room and runs the coordinator.
    fn desired_announcement(&self) -> Option<HostAnnouncement> {
        let snapshot = self.snapshot.as_ref()?;
        if snapshot.room.host_device_id != self.cfg.device_id {
            return None;
        }
        let port = self.coordinator.as_ref()?.port();
        Some(HostAnnouncement {
            room_id: snapshot.room.room_id.clone(),
            join_code: snapshot.room.join_code.clone(),
            host_client_id: self.client_id.clone().unwrap_or_default(),
            port,
        })
    }

    /// Reconcile the announcer with the desired announcement, restarting it
    /// when the announced identity changed (e.g. a fresh WELCOME).
    async fn sync_announcer(&mut self) {
        match self.desired_announcement() {
            Some(announcement) if announcement.is_complete() => {
                if self.announcer.is_running()
                    && self.current_announcement.as_ref() == Some(&announcement)
                {
                    return;
                }
                self.announcer.stop();
                match self
                    .announcer
                    .start(announcement.clone(), self.cfg.discovery_port)
                    .await
                {
                    Ok(()) => self.current_announcement = Some(announcement),
                    Err(e) => tracing::warn!("Could not start announcer: {}", e),
                }
            }
            _ => {
                if self.announcer.is_running() {
                    self.announcer.stop();
                    self.current_announcement = None;
                }
            }
        }
    }

    fn teardown_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Peer engine shutting down");
        self.teardown_conn();
        self.announcer.stop();
        self.discoverer.stop();
        if let Some(handle) = self.coordinator.take() {
            handle.stop().await;
        }
    }
}
