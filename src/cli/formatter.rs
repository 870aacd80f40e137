//! Display formatting for the interactive session.

use crate::common::time::format_millis;
use crate::discovery::DiscoveredHost;
use crate::room::{Role, Snapshot};

/// Message formatter for terminal display
pub struct MessageFormatter;

impl MessageFormatter {
    /// Format the room state after a snapshot update.
    ///
    /// Shows the join code, every member (host marked, this device marked),
    /// and the chat length.
    pub fn format_room(snapshot: &Snapshot, my_device_id: &str) -> String {
        let mut output = String::new();
        output.push_str("\n============================================================\n");
        output.push_str(&format!(
            "Room {}  (join code: {})\n",
            snapshot.room.room_id, snapshot.room.join_code
        ));
        for member in &snapshot.room.members {
            let host_mark = if member.role == Role::Host { "[host] " } else { "" };
            let me_mark = if member.device_id == my_device_id {
                " (me)"
            } else {
                ""
            };
            output.push_str(&format!(
                "  {}{}{} - device {}\n",
                host_mark, member.name, me_mark, member.device_id
            ));
        }
        output.push_str(&format!("  {} chat message(s)\n", snapshot.room.chat.len()));
        output.push_str("============================================================\n");
        output
    }

    /// Format an incoming chat line.
    pub fn format_chat(from_name: &str, text: &str, timestamp: i64) -> String {
        format!("\n@{}: {}  ({})\n", from_name, text, format_millis(timestamp))
    }

    /// Format a discovered room, one line per host.
    pub fn format_discovered(host: &DiscoveredHost) -> String {
        format!(
            "Found room {} code={} at {}:{}",
            host.room_id, host.join_code, host.ip, host.port
        )
    }

    /// Format a coordinator-reported error.
    pub fn format_error(reason: &str) -> String {
        format!("\n! error: {}\n", reason)
    }
}
