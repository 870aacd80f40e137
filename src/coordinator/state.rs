//! The coordinator's serialized state and message dispatch.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::common::{identity, time};
use crate::protocol::{Frame, FrameBody};
use crate::room::{RoomError, RoomRegistry, Snapshot};

use super::HEARTBEAT_TIMEOUT;

/// Events produced by socket tasks and consumed by the event loop.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Connected {
        client_id: String,
        sender: mpsc::UnboundedSender<SocketCommand>,
    },
    FrameReceived {
        client_id: String,
        frame: Frame,
    },
    Disconnected {
        client_id: String,
    },
}

/// Commands the event loop hands back to a connection's socket task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Send an encoded frame.
    Send(String),
    /// Send a close frame with the given reason and end the connection.
    Close { reason: String },
}

/// Per-connection state. Identity is unset until HELLO.
struct ConnectionEntry {
    sender: mpsc::UnboundedSender<SocketCommand>,
    device_id: Option<String>,
    name: Option<String>,
    last_active: Instant,
}

/// All mutable coordinator state, owned by the event loop task.
pub struct CoordinatorState {
    connections: HashMap<String, ConnectionEntry>,
    rooms: RoomRegistry,
    next_server_request: u64,
}

impl CoordinatorState {
    pub fn new(seed: Option<Snapshot>) -> Self {
        let rooms = match seed {
            Some(snapshot) => {
                tracing::info!(
                    "Restoring room '{}' (code {}, {} members, {} chat entries)",
                    snapshot.room.room_id,
                    snapshot.room.join_code,
                    snapshot.room.members.len(),
                    snapshot.room.chat.len()
                );
                RoomRegistry::from_snapshot(snapshot)
            }
            None => RoomRegistry::new(),
        };
        Self {
            connections: HashMap::new(),
            rooms,
            next_server_request: 0,
        }
    }

    pub fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected { client_id, sender } => {
                tracing::info!("Connection '{}' accepted", client_id);
                self.connections.insert(
                    client_id,
                    ConnectionEntry {
                        sender,
                        device_id: None,
                        name: None,
                        last_active: Instant::now(),
                    },
                );
            }
            CoordinatorEvent::FrameReceived { client_id, frame } => {
                self.handle_frame(&client_id, frame);
            }
            CoordinatorEvent::Disconnected { client_id } => {
                self.handle_disconnected(&client_id);
            }
        }
    }

    /// Heartbeat tick: close connections silent for longer than the cutoff,
    /// ping everyone else.
    pub fn heartbeat(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_active) > HEARTBEAT_TIMEOUT)
            .map(|(client_id, _)| client_id.clone())
            .collect();

        for client_id in timed_out {
            tracing::warn!("Connection '{}' timed out; closing", client_id);
            if let Some(entry) = self.connections.remove(&client_id) {
                let _ = entry.sender.send(SocketCommand::Close {
                    reason: "Heartbeat timeout".to_string(),
                });
                if let Some(device_id) = entry.device_id {
                    self.handle_departure(&device_id);
                }
            }
        }

        let request_id = self.next_request_id();
        let ping = Frame::server(
            request_id,
            FrameBody::Ping {
                timestamp: time::now_millis(),
            },
        )
        .encode();
        for entry in self.connections.values() {
            let _ = entry.sender.send(SocketCommand::Send(ping.clone()));
        }
    }

    fn handle_disconnected(&mut self, client_id: &str) {
        // The heartbeat path may already have removed the entry; the socket
        // task's own close event is then stale.
        let Some(entry) = self.connections.remove(client_id) else {
            return;
        };
        tracing::info!("Connection '{}' closed", client_id);
        if let Some(device_id) = entry.device_id {
            self.handle_departure(&device_id);
        }
    }

    /// Remove a departed device from its room and broadcast the new state.
    fn handle_departure(&mut self, device_id: &str) {
        if let Some(room) = self.rooms.leave_room(device_id) {
            let room_id = room.room_id.clone();
            self.broadcast_snapshot(&room_id);
        }
    }

    fn handle_frame(&mut self, client_id: &str, frame: Frame) {
        let Some(entry) = self.connections.get_mut(client_id) else {
            tracing::debug!("Frame from unknown connection '{}'", client_id);
            return;
        };
        entry.last_active = Instant::now();
        let request_id = frame.request_id;

        match frame.body {
            FrameBody::Ping { .. } => {
                self.send_to(
                    client_id,
                    Frame::server(
                        request_id,
                        FrameBody::Pong {
                            timestamp: time::now_millis(),
                        },
                    ),
                );
            }
            FrameBody::Pong { .. } => {}
            FrameBody::Hello { device_id, name } => {
                self.handle_hello(client_id, &request_id, device_id, name);
            }
            FrameBody::CreateRoom { room_name, .. } => {
                self.handle_create_room(client_id, &request_id, room_name);
            }
            FrameBody::JoinRoom { join_code } => {
                self.handle_join_room(client_id, &request_id, &join_code);
            }
            FrameBody::LeaveRoom => {
                self.handle_leave_room(client_id, &request_id);
            }
            FrameBody::Chat { text } => {
                self.handle_chat(client_id, &request_id, text);
            }
            FrameBody::Kick { target_device_id } => {
                self.handle_kick(client_id, &request_id, &target_device_id);
            }
            FrameBody::Welcome { .. }
            | FrameBody::Error { .. }
            | FrameBody::ChatBroadcast { .. }
            | FrameBody::Kicked { .. }
            | FrameBody::StateSnapshot { .. } => {
                self.send_error(client_id, &request_id, "Unsupported message type", None);
            }
        }
    }

    fn handle_hello(&mut self, client_id: &str, request_id: &str, device_id: String, name: String) {
        tracing::info!(
            "HELLO from '{}' as device '{}' ({})",
            client_id,
            device_id,
            name
        );
        if let Some(entry) = self.connections.get_mut(client_id) {
            entry.device_id = Some(device_id.clone());
            entry.name = Some(name);
        }
        self.send_to(
            client_id,
            Frame::server(
                request_id,
                FrameBody::Welcome {
                    client_id: client_id.to_string(),
                },
            ),
        );

        // Restore path: a device already present in a (seeded) room gets its
        // provisional client id replaced and the room rebroadcast.
        if let Some(room) = self.rooms.update_client_id(&device_id, client_id) {
            let room_id = room.room_id.clone();
            tracing::info!("Device '{}' reattached to room '{}'", device_id, room_id);
            self.broadcast_snapshot(&room_id);
        }
    }

    fn handle_create_room(
        &mut self,
        client_id: &str,
        request_id: &str,
        room_name: Option<String>,
    ) {
        let Some((device_id, name)) = self.identity_of(client_id) else {
            self.send_unauthenticated(client_id, request_id);
            return;
        };
        if let Some(room_name) = room_name {
            tracing::debug!("Ignoring room name '{}' (rooms are code-addressed)", room_name);
        }
        // Creating while still in a room is modeled as leave + create.
        self.handle_departure(&device_id);

        let room_id = identity::generate_id("room");
        let room = self.rooms.create_room(
            room_id.clone(),
            device_id,
            client_id.to_string(),
            name,
        );
        tracing::info!(
            "Room '{}' created with join code {}",
            room.room_id,
            room.join_code
        );
        self.broadcast_snapshot(&room_id);
    }

    fn handle_join_room(&mut self, client_id: &str, request_id: &str, join_code: &str) {
        let Some((device_id, name)) = self.identity_of(client_id) else {
            self.send_unauthenticated(client_id, request_id);
            return;
        };
        match self
            .rooms
            .join_room_by_code(join_code, device_id, client_id.to_string(), name)
        {
            Ok(room) => {
                let room_id = room.room_id.clone();
                self.broadcast_snapshot(&room_id);
            }
            Err(e) => self.send_room_error(client_id, request_id, &e),
        }
    }

    fn handle_leave_room(&mut self, client_id: &str, request_id: &str) {
        let Some((device_id, _)) = self.identity_of(client_id) else {
            self.send_unauthenticated(client_id, request_id);
            return;
        };
        self.handle_departure(&device_id);
    }

    fn handle_chat(&mut self, client_id: &str, request_id: &str, text: String) {
        let Some((device_id, _)) = self.identity_of(client_id) else {
            self.send_unauthenticated(client_id, request_id);
            return;
        };
        let Some(room) = self.rooms.room_of_device(&device_id) else {
            self.send_room_error(client_id, request_id, &RoomError::NotInRoom);
            return;
        };
        let room_id = room.room_id.clone();
        match self
            .rooms
            .append_chat(&room_id, &device_id, text, time::now_millis())
        {
            Ok(entry) => {
                let request_id = self.next_request_id();
                let chat = Frame::server(
                    request_id,
                    FrameBody::ChatBroadcast {
                        from_device_id: entry.from_device_id,
                        from_name: entry.from_name,
                        text: entry.text,
                        timestamp: entry.timestamp,
                    },
                );
                self.broadcast_to_room(&room_id, chat);
                self.broadcast_snapshot(&room_id);
            }
            Err(e) => self.send_room_error(client_id, request_id, &e),
        }
    }

    fn handle_kick(&mut self, client_id: &str, request_id: &str, target_device_id: &str) {
        let Some((device_id, _)) = self.identity_of(client_id) else {
            self.send_unauthenticated(client_id, request_id);
            return;
        };
        match self.rooms.kick(&device_id, target_device_id) {
            Ok(room) => {
                let room_id = room.room_id.clone();
                tracing::info!(
                    "Device '{}' kicked from room '{}' by host",
                    target_device_id,
                    room_id
                );
                if let Some(target_client) = self.client_of_device(target_device_id) {
                    let kicked_request = self.next_request_id();
                    self.send_to(
                        &target_client,
                        Frame::server(
                            kicked_request,
                            FrameBody::Kicked {
                                reason: "Kicked by host".to_string(),
                            },
                        ),
                    );
                    if let Some(entry) = self.connections.get(&target_client) {
                        let _ = entry.sender.send(SocketCommand::Close {
                            reason: "Kicked by host".to_string(),
                        });
                    }
                }
                self.broadcast_snapshot(&room_id);
            }
            Err(e) => self.send_room_error(client_id, request_id, &e),
        }
    }

    /// Identity bound to a connection by HELLO.
    fn identity_of(&self, client_id: &str) -> Option<(String, String)> {
        let entry = self.connections.get(client_id)?;
        Some((entry.device_id.clone()?, entry.name.clone()?))
    }

    /// The connection currently bound to a device.
    fn client_of_device(&self, device_id: &str) -> Option<String> {
        self.connections
            .iter()
            .find(|(_, entry)| entry.device_id.as_deref() == Some(device_id))
            .map(|(client_id, _)| client_id.clone())
    }

    fn broadcast_snapshot(&mut self, room_id: &str) {
        let Some(snapshot) = self.rooms.make_snapshot(room_id) else {
            return;
        };
        let request_id = self.next_request_id();
        let frame = Frame::server(request_id, FrameBody::StateSnapshot { snapshot });
        self.broadcast_to_room(room_id, frame);
    }

    /// Send a frame to every current member of a room.
    fn broadcast_to_room(&mut self, room_id: &str, frame: Frame) {
        let Some(room) = self.rooms.room(room_id) else {
            return;
        };
        let encoded = frame.encode();
        for member in &room.members {
            if let Some(entry) = self.connections.get(&member.client_id) {
                if entry.sender.send(SocketCommand::Send(encoded.clone())).is_err() {
                    tracing::warn!(
                        "Failed to push frame to client '{}'",
                        member.client_id
                    );
                }
            }
        }
    }

    fn send_to(&mut self, client_id: &str, frame: Frame) {
        if let Some(entry) = self.connections.get(client_id) {
            if entry.sender.send(SocketCommand::Send(frame.encode())).is_err() {
                tracing::warn!("Failed to push frame to client '{}'", client_id);
            }
        }
    }

    fn send_error(
        &mut self,
        client_id: &str,
        request_id: &str,
        reason: &str,
        code: Option<&str>,
    ) {
        self.send_to(
            client_id,
            Frame::server(
                request_id,
                FrameBody::Error {
                    reason: reason.to_string(),
                    code: code.map(str::to_string),
                },
            ),
        );
    }

    fn send_unauthenticated(&mut self, client_id: &str, request_id: &str) {
        self.send_error(
            client_id,
            request_id,
            "Must send HELLO first",
            Some("UNAUTHENTICATED"),
        );
    }

    fn send_room_error(&mut self, client_id: &str, request_id: &str, error: &RoomError) {
        let reason = format!("{}: {}", error.code(), error);
        self.send_error(client_id, request_id, &reason, Some(error.code()));
    }

    fn next_request_id(&mut self) -> String {
        self.next_server_request += 1;
        format!("srv-{}", self.next_server_request)
    }
}
