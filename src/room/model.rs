//! Room data model: members, chat entries, and the replicated snapshot.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Maximum number of chat entries retained per room.
pub const CHAT_CAPACITY: usize = 50;
/// Length of a join code.
pub const JOIN_CODE_LEN: usize = 6;
/// Characters a join code is drawn from.
pub const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Check that a string is a well-formed join code.
pub fn is_valid_join_code(value: &str) -> bool {
    value.len() == JOIN_CODE_LEN
        && value
            .bytes()
            .all(|b| JOIN_CODE_ALPHABET.contains(&b))
}

/// Member role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Member,
}

/// One logical participant of a room.
///
/// `device_id` is stable across reconnects; `client_id` is the current
/// connection identity and is reassigned whenever the device reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub device_id: String,
    pub client_id: String,
    pub name: String,
    pub join_order: u64,
    pub role: Role,
}

/// A single chat line. `from_name` is the sender's name at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub from_device_id: String,
    pub from_name: String,
    pub text: String,
    pub timestamp: i64,
}

/// A room: identity, ordered member list, and the bounded chat buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub join_code: String,
    pub host_device_id: String,
    pub members: Vec<Member>,
    pub chat: VecDeque<ChatEntry>,
}

impl Room {
    /// Look up a member by device id.
    pub fn member(&self, device_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.device_id == device_id)
    }

    /// Mutable lookup by device id.
    pub fn member_mut(&mut self, device_id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.device_id == device_id)
    }

    pub fn is_member(&self, device_id: &str) -> bool {
        self.member(device_id).is_some()
    }

    /// True when another member than `device_id` already uses `name`.
    pub fn name_taken_by_other(&self, name: &str, device_id: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.name == name && m.device_id != device_id)
    }

    /// Append a chat entry, discarding the oldest when the buffer is full.
    pub fn push_chat(&mut self, entry: ChatEntry) {
        if self.chat.len() >= CHAT_CAPACITY {
            self.chat.pop_front();
        }
        self.chat.push_back(entry);
    }
}

/// The complete replicated datum broadcast on every observable mutation.
///
/// The identity lookups are derived from the member list; receivers rebuild
/// them on restore so they can never drift from the members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room: Room,
    pub device_to_client: HashMap<String, String>,
    pub device_to_name: HashMap<String, String>,
}

impl Snapshot {
    /// Deep-copy a room into a snapshot with freshly built lookups.
    pub fn of_room(room: &Room) -> Self {
        let mut snapshot = Snapshot {
            room: room.clone(),
            device_to_client: HashMap::new(),
            device_to_name: HashMap::new(),
        };
        snapshot.rebuild_lookups();
        snapshot
    }

    /// Rebuild both identity lookups from the member list.
    pub fn rebuild_lookups(&mut self) {
        self.device_to_client = self
            .room
            .members
            .iter()
            .map(|m| (m.device_id.clone(), m.client_id.clone()))
            .collect();
        self.device_to_name = self
            .room
            .members
            .iter()
            .map(|m| (m.device_id.clone(), m.name.clone()))
            .collect();
    }

    /// The member currently holding the host role, if consistent.
    pub fn host(&self) -> Option<&Member> {
        self.room.member(&self.room.host_device_id)
    }
}
