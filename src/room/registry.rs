//! The coordinator's room registry.
//!
//! Pure in-memory state. Every operation either mutates to a valid state or
//! fails without side effects; the coordinator's event loop serializes all
//! calls, so no interior locking is needed.

use std::collections::HashMap;

use rand::Rng;

use super::election::elect;
use super::error::RoomError;
use super::model::{ChatEntry, JOIN_CODE_ALPHABET, JOIN_CODE_LEN, Member, Role, Room, Snapshot};

/// All live rooms of one coordinator, plus the coordinator-wide join counter.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    /// join code -> room id, for O(1) join and uniqueness checks.
    codes: HashMap<String, String>,
    next_join_order: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registry from a replicated snapshot.
    ///
    /// Preserves room identity, member list (including join orders), and
    /// chat. Client ids in the snapshot are provisional until the devices
    /// re-HELLO; the join counter resumes past the highest restored order.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let next_join_order = snapshot
            .room
            .members
            .iter()
            .map(|m| m.join_order + 1)
            .max()
            .unwrap_or(0);
        let mut rooms = HashMap::new();
        let mut codes = HashMap::new();
        codes.insert(snapshot.room.join_code.clone(), snapshot.room.room_id.clone());
        rooms.insert(snapshot.room.room_id.clone(), snapshot.room);
        Self {
            rooms,
            codes,
            next_join_order,
        }
    }

    /// Create a room with `host_device_id` as its first member and host.
    ///
    /// Allocates a fresh join code unique among this coordinator's live
    /// rooms.
    pub fn create_room(
        &mut self,
        room_id: String,
        host_device_id: String,
        host_client_id: String,
        host_name: String,
    ) -> &Room {
        let join_code = self.alloc_join_code();
        let join_order = self.next_join_order;
        self.next_join_order += 1;

        let room = Room {
            room_id: room_id.clone(),
            join_code: join_code.clone(),
            host_device_id: host_device_id.clone(),
            members: vec![Member {
                device_id: host_device_id,
                client_id: host_client_id,
                name: host_name,
                join_order,
                role: Role::Host,
            }],
            chat: Default::default(),
        };
        self.codes.insert(join_code, room_id.clone());
        self.rooms.entry(room_id).or_insert(room)
    }

    /// Join a live room by its code.
    pub fn join_room_by_code(
        &mut self,
        code: &str,
        device_id: String,
        client_id: String,
        name: String,
    ) -> Result<&Room, RoomError> {
        let room_id = self
            .codes
            .get(code)
            .cloned()
            .ok_or_else(|| RoomError::InvalidJoinCode(code.to_string()))?;
        let join_order = self.next_join_order;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| RoomError::InvalidJoinCode(code.to_string()))?;

        if room.name_taken_by_other(&name, &device_id) {
            return Err(RoomError::NameConflict(name));
        }

        if let Some(existing) = room.member_mut(&device_id) {
            // Same device joining again is a reconnect, not a new member.
            existing.client_id = client_id;
            existing.name = name;
        } else {
            room.members.push(Member {
                device_id,
                client_id,
                name,
                join_order,
                role: Role::Member,
            });
            self.next_join_order += 1;
        }
        Ok(room)
    }

    /// Remove a device from its room.
    ///
    /// Returns the surviving room, or `None` when the device was not a
    /// member or the room emptied and was destroyed. A departing host is
    /// replaced by election among the remaining members.
    pub fn leave_room(&mut self, device_id: &str) -> Option<&Room> {
        let room_id = self.room_of_device(device_id)?.room_id.clone();
        let room = self.rooms.get_mut(&room_id)?;
        let was_host = room.host_device_id == device_id;
        room.members.retain(|m| m.device_id != device_id);

        if room.members.is_empty() {
            let join_code = room.join_code.clone();
            self.rooms.remove(&room_id);
            self.codes.remove(&join_code);
            tracing::info!("Room '{}' destroyed (last member left)", room_id);
            return None;
        }

        if was_host {
            let new_host = elect(&room.members)
                .map(|m| m.device_id.clone())
                .unwrap_or_default();
            room.host_device_id = new_host.clone();
            for member in &mut room.members {
                member.role = if member.device_id == new_host {
                    Role::Host
                } else {
                    Role::Member
                };
            }
            tracing::info!("Room '{}' host handed to '{}'", room_id, new_host);
        }
        self.rooms.get(&room_id)
    }

    /// Remove `target_device_id` from the caller's room.
    pub fn kick(
        &mut self,
        host_device_id: &str,
        target_device_id: &str,
    ) -> Result<&Room, RoomError> {
        let room = self
            .room_of_device(host_device_id)
            .ok_or(RoomError::NotInRoom)?;
        if room.host_device_id != host_device_id {
            return Err(RoomError::NotHost);
        }
        if !room.is_member(target_device_id) || target_device_id == host_device_id {
            return Err(RoomError::NotInRoom);
        }
        let room_id = room.room_id.clone();
        let room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotInRoom)?;
        room.members.retain(|m| m.device_id != target_device_id);
        Ok(room)
    }

    /// Append a chat entry stamped with the sender's current name.
    pub fn append_chat(
        &mut self,
        room_id: &str,
        from_device_id: &str,
        text: String,
        timestamp: i64,
    ) -> Result<ChatEntry, RoomError> {
        let room = self.rooms.get_mut(room_id).ok_or(RoomError::NotInRoom)?;
        let from_name = room
            .member(from_device_id)
            .map(|m| m.name.clone())
            .ok_or(RoomError::NotInRoom)?;
        let entry = ChatEntry {
            from_device_id: from_device_id.to_string(),
            from_name,
            text,
            timestamp,
        };
        room.push_chat(entry.clone());
        Ok(entry)
    }

    /// Deep-copy snapshot of one room.
    pub fn make_snapshot(&self, room_id: &str) -> Option<Snapshot> {
        self.rooms.get(room_id).map(Snapshot::of_room)
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// The room a device is currently a member of, if any.
    pub fn room_of_device(&self, device_id: &str) -> Option<&Room> {
        self.rooms.values().find(|room| room.is_member(device_id))
    }

    /// Bind a reconnected device to its new connection identity.
    ///
    /// Part of the restore path: snapshot client ids are provisional until
    /// the device re-HELLOs. Returns the updated room.
    pub fn update_client_id(&mut self, device_id: &str, client_id: &str) -> Option<&Room> {
        let room_id = self.room_of_device(device_id)?.room_id.clone();
        let room = self.rooms.get_mut(&room_id)?;
        room.member_mut(device_id)?.client_id = client_id.to_string();
        Some(room)
    }

    fn alloc_join_code(&mut self) -> String {
        let mut rng = rand::rng();
        loop {
            let code: String = (0..JOIN_CODE_LEN)
                .map(|_| {
                    let idx = rng.random_range(0..JOIN_CODE_ALPHABET.len());
                    JOIN_CODE_ALPHABET[idx] as char
                })
                .collect();
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }
}
