//! The peer engine: every device runs one.
//!
//! A peer is always a client of some coordinator and may additionally host
//! one. The engine owns the connection lifecycle, the replicated snapshot
//! cache, and the migration state machine that survives coordinator loss.

mod connection;
mod engine;

pub use engine::{PeerCommand, PeerConfig, PeerEngine, PeerHandle, PeerNotification};
