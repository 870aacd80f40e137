//! The peer's WebSocket connection to a coordinator.
//!
//! I/O tasks are producers only: the reader decodes frames and hands them to
//! the engine's event loop, the writer drains the outbound queue. Events
//! carry the connection's sequence number so the engine can discard events
//! from a connection it has already replaced.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite};

use crate::protocol::Frame;

/// Events produced by connection and discovery drivers for the engine loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded frame from the coordinator.
    FrameReceived { conn: u64, frame: Frame },
    /// The transport closed (clean close or error, reported once).
    ConnectionClosed { conn: u64 },
    /// The discoverer saw a new host this window.
    HostFound(crate::discovery::DiscoveredHost),
    /// The Awaiting-Host timer fired.
    MigrationTimeout { generation: u64 },
}

/// An open connection: outbound queue plus the two I/O tasks.
pub struct ActiveConnection {
    pub id: u64,
    pub url: String,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ActiveConnection {
    /// Queue an encoded frame. Returns false when the writer is gone.
    pub fn send(&self, encoded: String) -> bool {
        self.outbound.send(encoded).is_ok()
    }

    /// Tear down both I/O tasks and drop the socket.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Open a WebSocket connection to `url`.
///
/// The spawned reader reports decoded frames and exactly one
/// [`PeerEvent::ConnectionClosed`] tagged with `conn_id`.
pub async fn open(
    url: &str,
    conn_id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Result<ActiveConnection, tungstenite::Error> {
    let (ws, _response) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink
                .send(tungstenite::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(tungstenite::Message::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(frame) => {
                        if events
                            .send(PeerEvent::FrameReceived {
                                conn: conn_id,
                                frame,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping malformed frame from coordinator: {}", e);
                    }
                },
                Ok(tungstenite::Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            }
        }
        let _ = events.send(PeerEvent::ConnectionClosed { conn: conn_id });
    });

    Ok(ActiveConnection {
        id: conn_id,
        url: url.to_string(),
        outbound,
        reader,
        writer,
    })
}
