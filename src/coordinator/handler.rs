//! WebSocket gateway: accepts connections and bridges sockets to the event
//! loop. Socket tasks never touch coordinator state directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{Frame, FrameBody, request_id_of};

use super::state::{CoordinatorEvent, SocketCommand};

/// State shared by the axum handlers: the event-loop inlet and the
/// connection-id counter.
pub struct GatewayState {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    next_client: AtomicU64,
}

impl GatewayState {
    pub fn new(events: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self {
            events,
            next_client: AtomicU64::new(1),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let client_id = format!("client-{}", state.next_client.fetch_add(1, Ordering::SeqCst));
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();

    if state
        .events
        .send(CoordinatorEvent::Connected {
            client_id: client_id.clone(),
            sender: tx.clone(),
        })
        .is_err()
    {
        // Event loop already gone; drop the connection.
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    // Drain event-loop commands onto the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Send(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Decode inbound frames and hand them to the event loop. Malformed
    // frames are answered with ERROR right here and dropped.
    let events = state.events.clone();
    let reader_client_id = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("WebSocket error on '{}': {}", reader_client_id, e);
                    break;
                }
            };
            match message {
                Message::Text(text) => match Frame::decode(text.as_str()) {
                    Ok(frame) => {
                        if events
                            .send(CoordinatorEvent::FrameReceived {
                                client_id: reader_client_id.clone(),
                                frame,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Dropping malformed frame from '{}': {}",
                            reader_client_id,
                            e
                        );
                        let request_id = request_id_of(text.as_str()).unwrap_or_default();
                        let error = Frame::server(
                            request_id,
                            FrameBody::Error {
                                reason: format!("MALFORMED_FRAME: {}", e),
                                code: Some("MALFORMED_FRAME".to_string()),
                            },
                        );
                        let _ = tx.send(SocketCommand::Send(error.encode()));
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // If either side finishes, tear the other down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    let _ = state
        .events
        .send(CoordinatorEvent::Disconnected { client_id });
}
