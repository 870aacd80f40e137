//! The `lanforge` command surface: `host`, `discover`, `join`, and the
//! interactive stdin session shared by the first and last of those.

mod formatter;

use std::io::Write;
use std::time::Duration;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;

use crate::common::identity;
use crate::discovery::Discoverer;
use crate::peer::{PeerConfig, PeerEngine, PeerHandle, PeerNotification};

pub use formatter::MessageFormatter;

/// Options shared by the session commands.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Port this peer binds when hosting (initially or after migration).
    pub coordinator_port: u16,
    pub discovery_port: u16,
}

/// `host [name]`: start a coordinator, connect to it, create a room, and
/// announce it. Returns the process exit code.
pub async fn run_host(
    name: Option<String>,
    options: SessionOptions,
) -> Result<i32, Box<dyn std::error::Error>> {
    let device_id = identity::device_id();
    let name = identity::display_name(name);
    tracing::info!("Hosting as '{}' (device {})", name, device_id);

    let mut cfg = PeerConfig::new(device_id.clone(), name.clone());
    cfg.coordinator_port = options.coordinator_port;
    cfg.discovery_port = options.discovery_port;

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let handle = PeerEngine::spawn(cfg, notify_tx);
    handle.host_room(None);

    Ok(session_loop(handle, notify_rx, &name, &device_id).await)
}

/// `join <name> <joinCode>`: connect to the configured coordinator and join
/// the room. Returns the process exit code.
pub async fn run_join(
    name: String,
    join_code: String,
    url: Option<String>,
    options: SessionOptions,
) -> Result<i32, Box<dyn std::error::Error>> {
    let device_id = identity::device_id();
    let name = identity::display_name(Some(name));
    tracing::info!("Joining as '{}' (device {})", name, device_id);

    let mut cfg = PeerConfig::new(device_id.clone(), name.clone());
    cfg.server_url = url.unwrap_or_else(identity::server_url);
    cfg.coordinator_port = options.coordinator_port;
    cfg.discovery_port = options.discovery_port;

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let handle = PeerEngine::spawn(cfg, notify_tx);
    handle.start();
    handle.join_room(join_code);

    Ok(session_loop(handle, notify_rx, &name, &device_id).await)
}

/// `discover`: listen for announcements for `window` and print one line per
/// discovered host.
pub async fn run_discover(
    window: Duration,
    discovery_port: u16,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut discoverer = Discoverer::new();
    discoverer
        .start(discovery_port, |host| {
            println!("{}", MessageFormatter::format_discovered(&host));
        })
        .await?;
    tracing::info!("Discovering for {:?}...", window);
    tokio::time::sleep(window).await;
    discoverer.stop();
    Ok(0)
}

/// Redisplay the prompt after printing asynchronous output.
fn redisplay_prompt(name: &str) {
    print!("{}> ", name);
    std::io::stdout().flush().ok();
}

/// The interactive session: stdin lines become CHAT (or `/kick`, `/leave`,
/// `/quit`), engine notifications are rendered as they arrive.
async fn session_loop(
    handle: PeerHandle,
    mut notifications: mpsc::UnboundedReceiver<PeerNotification>,
    name: &str,
    device_id: &str,
) -> i32 {
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();

    // rustyline is synchronous; give it its own thread.
    let prompt = format!("{}> ", name);
    let _readline_handle = std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        rl.add_history_entry(line).ok();
                        if input_tx.send(line.to_string()).is_err() {
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => {
                    tracing::error!("Readline error: {}", e);
                    break;
                }
            }
        }
    });

    let mut input_open = true;
    let exit_code = loop {
        tokio::select! {
            line = input_rx.recv(), if input_open => match line {
                Some(line) => {
                    if let Some(code) = handle_input_line(&handle, &line) {
                        break code;
                    }
                }
                None => {
                    // stdin is done (EOF); keep serving notifications.
                    input_open = false;
                }
            },
            notification = notifications.recv() => match notification {
                Some(notification) => {
                    if let Some(code) = render_notification(notification, name, device_id) {
                        break code;
                    }
                }
                None => break 1,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break 0;
            }
        }
    };

    handle.shutdown();
    // Give the engine a moment to stop its coordinator and sockets.
    tokio::time::sleep(Duration::from_millis(300)).await;
    exit_code
}

/// Interpret one stdin line. `Some(code)` ends the session.
fn handle_input_line(handle: &PeerHandle, line: &str) -> Option<i32> {
    if line == "/quit" {
        return Some(0);
    }
    if line == "/leave" {
        handle.leave_room();
        return None;
    }
    if let Some(target) = line.strip_prefix("/kick ") {
        let target = target.trim();
        if target.is_empty() {
            println!("usage: /kick <deviceId>");
        } else {
            handle.kick(target.to_string());
        }
        return None;
    }
    if line.starts_with('/') {
        println!("unknown command: {}", line);
        return None;
    }
    handle.send_chat(line.to_string());
    None
}

/// Render one engine notification. `Some(code)` ends the session.
fn render_notification(
    notification: PeerNotification,
    name: &str,
    device_id: &str,
) -> Option<i32> {
    match notification {
        PeerNotification::Connected { url } => {
            println!("Connected to {}", url);
            redisplay_prompt(name);
        }
        PeerNotification::Welcome { client_id } => {
            tracing::debug!("Session client id: {}", client_id);
        }
        PeerNotification::Snapshot(snapshot) => {
            print!("{}", MessageFormatter::format_room(&snapshot, device_id));
            redisplay_prompt(name);
        }
        PeerNotification::Chat {
            from_name,
            text,
            timestamp,
        } => {
            print!("{}", MessageFormatter::format_chat(&from_name, &text, timestamp));
            redisplay_prompt(name);
        }
        PeerNotification::ServerError { reason } => {
            print!("{}", MessageFormatter::format_error(&reason));
            redisplay_prompt(name);
        }
        PeerNotification::Kicked { reason } => {
            println!("\nYou were removed from the room: {}", reason);
            redisplay_prompt(name);
        }
        PeerNotification::Hosting { addr } => {
            println!("Hosting room on {}", addr);
            redisplay_prompt(name);
        }
        PeerNotification::SessionEnded { reason } => {
            println!("\nSession ended: {}", reason);
            return Some(1);
        }
    }
    None
}
