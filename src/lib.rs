//! LanForge: offline LAN multiplayer coordination.
//!
//! A set of devices on the same link discover each other over UDP broadcast,
//! form a room served by one peer-hosted coordinator, exchange chat, and
//! survive the loss of the coordinator by electing a replacement from the
//! replicated room snapshot.

pub mod cli;
pub mod common;
pub mod coordinator;
pub mod discovery;
pub mod peer;
pub mod protocol;
pub mod room;
