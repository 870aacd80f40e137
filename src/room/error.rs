//! Error types for room operations.

use thiserror::Error;

/// Failure modes of the room registry, mirrored onto ERROR frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// The supplied join code does not name a live room.
    #[error("no room with join code '{0}'")]
    InvalidJoinCode(String),

    /// Another member of the room already uses this display name.
    #[error("name '{0}' is already taken in this room")]
    NameConflict(String),

    /// The caller is not the host of the room.
    #[error("only the host may do that")]
    NotHost,

    /// The device is not a member of any room (or not of the named room).
    #[error("not in a room")]
    NotInRoom,
}

impl RoomError {
    /// Stable machine-readable code carried in ERROR frames.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::InvalidJoinCode(_) => "INVALID_JOIN_CODE",
            RoomError::NameConflict(_) => "NAME_CONFLICT",
            RoomError::NotHost => "NOT_HOST",
            RoomError::NotInRoom => "NOT_IN_ROOM",
        }
    }
}
