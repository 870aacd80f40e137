//! Device identity and environment-based configuration.
//!
//! A device keeps one stable `deviceId` across reconnects. It comes from
//! `LANFORGE_DEVICE_ID` when set; otherwise one is synthesized and cached for
//! the lifetime of the process (there is no persistent storage).

use std::sync::OnceLock;

use rand::Rng;

/// Environment variable holding the stable device identity.
pub const DEVICE_ID_ENV: &str = "LANFORGE_DEVICE_ID";
/// Environment variable holding the coordinator URL to join.
pub const SERVER_URL_ENV: &str = "LANFORGE_SERVER_URL";
/// Environment variable holding the display name.
pub const CLIENT_NAME_ENV: &str = "LANFORGE_CLIENT_NAME";

/// Default coordinator URL (well-known port 8080, WebSocket endpoint).
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

static PROCESS_DEVICE_ID: OnceLock<String> = OnceLock::new();

/// Generate a random lowercase-hex identifier with the given prefix.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| {
            let nibble: u8 = rng.random_range(0..16);
            char::from_digit(nibble as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Resolve the stable device identity for this process.
///
/// `LANFORGE_DEVICE_ID` wins when set and non-empty; otherwise an id is
/// synthesized once and reused for every later call in this process.
pub fn device_id() -> String {
    if let Ok(id) = std::env::var(DEVICE_ID_ENV)
        && !id.trim().is_empty()
    {
        return id;
    }
    PROCESS_DEVICE_ID
        .get_or_init(|| generate_id("dev"))
        .clone()
}

/// Resolve the coordinator URL: `LANFORGE_SERVER_URL` or the default.
pub fn server_url() -> String {
    std::env::var(SERVER_URL_ENV).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
}

/// Resolve a display name: explicit argument, then `LANFORGE_CLIENT_NAME`,
/// then a generated guest name.
pub fn display_name(arg: Option<String>) -> String {
    arg.filter(|name| !name.trim().is_empty())
        .or_else(|| {
            std::env::var(CLIENT_NAME_ENV)
                .ok()
                .filter(|name| !name.trim().is_empty())
        })
        .unwrap_or_else(|| generate_id("guest"))
}
