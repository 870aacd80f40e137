//! Authoritative in-memory room state: members, chat, join codes, snapshots,
//! and the deterministic host election.

mod election;
mod error;
mod model;
mod registry;

pub use election::{elect, migrate_snapshot, plan_succession, stable_hash};
pub use error::RoomError;
pub use model::{
    CHAT_CAPACITY, ChatEntry, JOIN_CODE_ALPHABET, JOIN_CODE_LEN, Member, Role, Room, Snapshot,
    is_valid_join_code,
};
pub use registry::RoomRegistry;
