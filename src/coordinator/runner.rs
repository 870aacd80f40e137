//! Coordinator startup and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::room::Snapshot;

use super::HEARTBEAT_INTERVAL;
use super::handler::{GatewayState, ws_handler};
use super::state::{CoordinatorEvent, CoordinatorState};

/// A running coordinator. Dropping the handle (or calling [`stop`]) shuts the
/// listener down and releases the port, so a later re-election on the same
/// device can bind it again.
///
/// [`stop`]: CoordinatorHandle::stop
pub struct CoordinatorHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    loop_task: JoinHandle<()>,
    serve_task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop serving: end the event loop (closing every connection) and wait
    /// for the listener to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.loop_task.await;
        let mut serve_task = self.serve_task;
        if tokio::time::timeout(Duration::from_secs(5), &mut serve_task)
            .await
            .is_err()
        {
            tracing::warn!("Coordinator listener did not stop in time; aborting it");
            serve_task.abort();
        }
        tracing::info!("Coordinator stopped");
    }
}

/// Bind `host:port` and start serving the coordinator protocol.
///
/// With `seed`, the room state is restored from a replicated snapshot before
/// any connection is accepted. Port 0 binds an ephemeral port; the real one
/// is available on the returned handle.
pub async fn start_coordinator(
    host: &str,
    port: u16,
    seed: Option<Snapshot>,
) -> std::io::Result<CoordinatorHandle> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    let local_addr = listener.local_addr()?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The serialized event loop: sole owner of rooms and connections.
    let mut loop_shutdown = shutdown_rx.clone();
    let loop_task = tokio::spawn(async move {
        let mut state = CoordinatorState::new(seed);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => state.handle_event(event),
                    None => break,
                },
                _ = heartbeat.tick() => state.heartbeat(),
                _ = loop_shutdown.changed() => break,
            }
        }
        tracing::debug!("Coordinator event loop ended");
    });

    let gateway = Arc::new(GatewayState::new(event_tx));
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(gateway);

    let mut serve_shutdown = shutdown_rx;
    let serve_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = serve_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("Coordinator listener error: {}", e);
        }
    });

    tracing::info!("Coordinator listening on {}", local_addr);
    Ok(CoordinatorHandle {
        local_addr,
        shutdown: shutdown_tx,
        loop_task,
        serve_task,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt, stream::{SplitSink, SplitStream}};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

    use super::*;
    use crate::protocol::{Frame, FrameBody, PENDING_CLIENT_ID};
    use crate::room::{Role, RoomRegistry};

    type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
    type WsSink = SplitSink<WsStream, Message>;
    type WsSource = SplitStream<WsStream>;

    async fn start() -> CoordinatorHandle {
        start_coordinator("127.0.0.1", 0, None)
            .await
            .expect("coordinator should start")
    }

    async fn connect(handle: &CoordinatorHandle) -> (WsSink, WsSource) {
        let url = format!("ws://127.0.0.1:{}/ws", handle.port());
        let (ws, _) = connect_async(url.as_str()).await.expect("connect");
        ws.split()
    }

    async fn send(sink: &mut WsSink, request_id: &str, client_id: &str, body: FrameBody) {
        let frame = Frame {
            request_id: request_id.to_string(),
            client_id: client_id.to_string(),
            body,
        };
        sink.send(Message::Text(frame.encode().into()))
            .await
            .expect("send frame");
    }

    /// Next non-PING frame, or panic after 5 s.
    async fn recv(source: &mut WsSource) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), source.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match message {
                Message::Text(text) => {
                    let frame = Frame::decode(text.as_str()).expect("server frame should decode");
                    if matches!(frame.body, FrameBody::Ping { .. }) {
                        continue;
                    }
                    return frame;
                }
                Message::Close(_) => panic!("connection closed while waiting for frame"),
                _ => continue,
            }
        }
    }

    /// Next non-PING frame, or `None` when the server closes the connection.
    async fn recv_or_close(source: &mut WsSource) -> Option<Frame> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), source.next())
                .await
                .expect("timed out waiting for frame")?;
            match message {
                Ok(Message::Text(text)) => {
                    let frame = Frame::decode(text.as_str()).expect("server frame should decode");
                    if matches!(frame.body, FrameBody::Ping { .. }) {
                        continue;
                    }
                    return Some(frame);
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn hello(sink: &mut WsSink, source: &mut WsSource, device_id: &str, name: &str) -> String {
        send(
            sink,
            "req-hello",
            PENDING_CLIENT_ID,
            FrameBody::Hello {
                device_id: device_id.to_string(),
                name: name.to_string(),
            },
        )
        .await;
        match recv(source).await.body {
            FrameBody::Welcome { client_id } => client_id,
            other => panic!("expected WELCOME, got {:?}", other),
        }
    }

    fn snapshot_of(frame: Frame) -> crate::room::Snapshot {
        match frame.body {
            FrameBody::StateSnapshot { snapshot } => snapshot,
            other => panic!("expected STATE_SNAPSHOT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hello_is_answered_with_welcome() {
        // テスト項目: HELLO に対して clientId 入りの WELCOME が返る
        // given (前提条件):
        let handle = start().await;
        let (mut sink, mut source) = connect(&handle).await;

        // when (操作):
        let client_id = hello(&mut sink, &mut source, "dev-a", "Alice").await;

        // then (期待する結果):
        assert!(!client_id.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_create_room_broadcasts_snapshot_with_host() {
        // テスト項目: CREATE_ROOM で作成者がホストのスナップショットが配信される
        // given (前提条件):
        let handle = start().await;
        let (mut sink, mut source) = connect(&handle).await;
        let client_id = hello(&mut sink, &mut source, "dev-a", "Alice").await;

        // when (操作):
        send(
            &mut sink,
            "req-create",
            &client_id,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;

        // then (期待する結果):
        let snapshot = snapshot_of(recv(&mut source).await);
        assert_eq!(snapshot.room.host_device_id, "dev-a");
        assert_eq!(snapshot.room.members.len(), 1);
        assert_eq!(snapshot.room.members[0].role, Role::Host);
        assert_eq!(snapshot.room.join_code.len(), 6);
        assert!(snapshot.room.chat.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_room_operation_before_hello_is_rejected() {
        // テスト項目: HELLO 前のルーム操作は ERROR になる
        // given (前提条件):
        let handle = start().await;
        let (mut sink, mut source) = connect(&handle).await;

        // when (操作):
        send(
            &mut sink,
            "req-1",
            PENDING_CLIENT_ID,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;

        // then (期待する結果):
        match recv(&mut source).await.body {
            FrameBody::Error { reason, .. } => {
                assert_eq!(reason, "Must send HELLO first");
            }
            other => panic!("expected ERROR, got {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_join_and_chat_reach_every_member() {
        // テスト項目: 参加とチャットが全メンバーに配信され、スナップショットに反映される
        // given (前提条件):
        let handle = start().await;
        let (mut sink_a, mut source_a) = connect(&handle).await;
        let client_a = hello(&mut sink_a, &mut source_a, "dev-a", "Alice").await;
        send(
            &mut sink_a,
            "req-create",
            &client_a,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;
        let join_code = snapshot_of(recv(&mut source_a).await).room.join_code;

        let (mut sink_b, mut source_b) = connect(&handle).await;
        let client_b = hello(&mut sink_b, &mut source_b, "dev-b", "Bob").await;

        // when (操作):
        send(
            &mut sink_b,
            "req-join",
            &client_b,
            FrameBody::JoinRoom {
                join_code: join_code.clone(),
            },
        )
        .await;

        // then (期待する結果):
        let snapshot_b = snapshot_of(recv(&mut source_b).await);
        assert_eq!(snapshot_b.room.members.len(), 2);
        assert_eq!(snapshot_b.room.host_device_id, "dev-a");
        assert!(snapshot_b.room.chat.is_empty());
        let snapshot_a = snapshot_of(recv(&mut source_a).await);
        assert_eq!(snapshot_a.room.members.len(), 2);

        // when (操作): B がチャットを送る
        send(
            &mut sink_b,
            "req-chat",
            &client_b,
            FrameBody::Chat {
                text: "hi".to_string(),
            },
        )
        .await;

        // then (期待する結果): 両方に CHAT が配信され、次のスナップショットに残る
        for source in [&mut source_a, &mut source_b] {
            match recv(source).await.body {
                FrameBody::ChatBroadcast {
                    from_name, text, ..
                } => {
                    assert_eq!(from_name, "Bob");
                    assert_eq!(text, "hi");
                }
                other => panic!("expected CHAT broadcast, got {:?}", other),
            }
            let snapshot = snapshot_of(recv(source).await);
            assert_eq!(snapshot.room.chat.len(), 1);
            assert_eq!(
                snapshot.room.chat.front().map(|e| e.from_name.as_str()),
                Some("Bob")
            );
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_join_is_rejected() {
        // テスト項目: 使用中の名前での参加は NAME_CONFLICT の ERROR になる
        // given (前提条件):
        let handle = start().await;
        let (mut sink_a, mut source_a) = connect(&handle).await;
        let client_a = hello(&mut sink_a, &mut source_a, "dev-a", "Alice").await;
        send(
            &mut sink_a,
            "req-create",
            &client_a,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;
        let join_code = snapshot_of(recv(&mut source_a).await).room.join_code;

        let (mut sink_c, mut source_c) = connect(&handle).await;
        let client_c = hello(&mut sink_c, &mut source_c, "dev-c", "Alice").await;

        // when (操作):
        send(
            &mut sink_c,
            "req-join",
            &client_c,
            FrameBody::JoinRoom { join_code },
        )
        .await;

        // then (期待する結果):
        match recv(&mut source_c).await.body {
            FrameBody::Error { reason, code } => {
                assert!(reason.contains("NAME_CONFLICT"), "reason: {reason}");
                assert_eq!(code.as_deref(), Some("NAME_CONFLICT"));
            }
            other => panic!("expected ERROR, got {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_kick_notifies_target_and_updates_room() {
        // テスト項目: KICK で対象に KICKED が届き、残りのメンバーに新スナップショットが配信される
        // given (前提条件):
        let handle = start().await;
        let (mut sink_a, mut source_a) = connect(&handle).await;
        let client_a = hello(&mut sink_a, &mut source_a, "dev-a", "Alice").await;
        send(
            &mut sink_a,
            "req-create",
            &client_a,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;
        let join_code = snapshot_of(recv(&mut source_a).await).room.join_code;

        let (mut sink_b, mut source_b) = connect(&handle).await;
        let client_b = hello(&mut sink_b, &mut source_b, "dev-b", "Bob").await;
        send(
            &mut sink_b,
            "req-join",
            &client_b,
            FrameBody::JoinRoom { join_code },
        )
        .await;
        let _ = snapshot_of(recv(&mut source_b).await);
        let _ = snapshot_of(recv(&mut source_a).await);

        // when (操作):
        send(
            &mut sink_a,
            "req-kick",
            &client_a,
            FrameBody::Kick {
                target_device_id: "dev-b".to_string(),
            },
        )
        .await;

        // then (期待する結果):
        match recv_or_close(&mut source_b).await {
            Some(frame) => match frame.body {
                FrameBody::Kicked { reason } => assert_eq!(reason, "Kicked by host"),
                other => panic!("expected KICKED, got {:?}", other),
            },
            None => panic!("expected KICKED before close"),
        }
        assert!(recv_or_close(&mut source_b).await.is_none());
        let snapshot = snapshot_of(recv(&mut source_a).await);
        assert_eq!(snapshot.room.members.len(), 1);
        assert!(!snapshot.room.is_member("dev-b"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_kick_from_non_host_is_rejected() {
        // テスト項目: ホスト以外の KICK は NOT_HOST の ERROR になる
        // given (前提条件):
        let handle = start().await;
        let (mut sink_a, mut source_a) = connect(&handle).await;
        let client_a = hello(&mut sink_a, &mut source_a, "dev-a", "Alice").await;
        send(
            &mut sink_a,
            "req-create",
            &client_a,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;
        let join_code = snapshot_of(recv(&mut source_a).await).room.join_code;

        let (mut sink_b, mut source_b) = connect(&handle).await;
        let client_b = hello(&mut sink_b, &mut source_b, "dev-b", "Bob").await;
        send(
            &mut sink_b,
            "req-join",
            &client_b,
            FrameBody::JoinRoom { join_code },
        )
        .await;
        let _ = snapshot_of(recv(&mut source_b).await);

        // when (操作):
        send(
            &mut sink_b,
            "req-kick",
            &client_b,
            FrameBody::Kick {
                target_device_id: "dev-a".to_string(),
            },
        )
        .await;

        // then (期待する結果):
        match recv(&mut source_b).await.body {
            FrameBody::Error { code, .. } => assert_eq!(code.as_deref(), Some("NOT_HOST")),
            other => panic!("expected ERROR, got {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_connection_close_removes_member_and_broadcasts() {
        // テスト項目: 接続断でメンバーが退室し、残りに新スナップショットが配信される
        // given (前提条件):
        let handle = start().await;
        let (mut sink_a, mut source_a) = connect(&handle).await;
        let client_a = hello(&mut sink_a, &mut source_a, "dev-a", "Alice").await;
        send(
            &mut sink_a,
            "req-create",
            &client_a,
            FrameBody::CreateRoom {
                room_name: None,
                max_players: None,
            },
        )
        .await;
        let join_code = snapshot_of(recv(&mut source_a).await).room.join_code;

        let (mut sink_b, mut source_b) = connect(&handle).await;
        let client_b = hello(&mut sink_b, &mut source_b, "dev-b", "Bob").await;
        send(
            &mut sink_b,
            "req-join",
            &client_b,
            FrameBody::JoinRoom { join_code },
        )
        .await;
        let _ = snapshot_of(recv(&mut source_b).await);
        let _ = snapshot_of(recv(&mut source_a).await);

        // when (操作):
        drop(sink_b);
        drop(source_b);

        // then (期待する結果):
        let snapshot = snapshot_of(recv(&mut source_a).await);
        assert_eq!(snapshot.room.members.len(), 1);
        assert!(!snapshot.room.is_member("dev-b"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_server_only_frame_type_is_unsupported() {
        // テスト項目: サーバー専用のフレーム種別を送ると ERROR になる
        // given (前提条件):
        let handle = start().await;
        let (mut sink, mut source) = connect(&handle).await;

        // when (操作):
        send(
            &mut sink,
            "req-1",
            PENDING_CLIENT_ID,
            FrameBody::Welcome {
                client_id: "client-x".to_string(),
            },
        )
        .await;

        // then (期待する結果):
        match recv(&mut source).await.body {
            FrameBody::Error { reason, .. } => assert_eq!(reason, "Unsupported message type"),
            other => panic!("expected ERROR, got {:?}", other),
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_answered_with_error_and_dropped() {
        // テスト項目: 不正なフレームは ERROR が返るだけで接続は維持される
        // given (前提条件):
        let handle = start().await;
        let (mut sink, mut source) = connect(&handle).await;

        // when (操作):
        sink.send(Message::Text("{\"requestId\":\"r1\"}".into()))
            .await
            .expect("send raw text");

        // then (期待する結果):
        match recv(&mut source).await.body {
            FrameBody::Error { reason, code } => {
                assert!(reason.contains("MALFORMED_FRAME"), "reason: {reason}");
                assert_eq!(code.as_deref(), Some("MALFORMED_FRAME"));
            }
            other => panic!("expected ERROR, got {:?}", other),
        }
        // Connection still works after the drop.
        let client_id = hello(&mut sink, &mut source, "dev-a", "Alice").await;
        assert!(!client_id.is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_seeded_coordinator_restores_room_and_rebinds_devices() {
        // テスト項目: スナップショットで初期化されたコーディネータがルームを復元し、
        //             再 HELLO したデバイスの clientId を更新して配信する
        // given (前提条件):
        let mut registry = RoomRegistry::new();
        registry.create_room(
            "room-origin".to_string(),
            "dev-a".to_string(),
            "stale-client-1".to_string(),
            "Alice".to_string(),
        );
        let code = registry
            .room("room-origin")
            .map(|r| r.join_code.clone())
            .expect("room");
        registry
            .join_room_by_code(&code, "dev-b".to_string(), "stale-client-2".to_string(), "Bob".to_string())
            .expect("join");
        registry
            .append_chat("room-origin", "dev-b", "before the crash".to_string(), 7)
            .expect("chat");
        let seed = registry.make_snapshot("room-origin").expect("snapshot");

        let handle = start_coordinator("127.0.0.1", 0, Some(seed))
            .await
            .expect("seeded coordinator should start");

        // when (操作):
        let (mut sink, mut source) = connect(&handle).await;
        let client_id = hello(&mut sink, &mut source, "dev-b", "Bob").await;

        // then (期待する結果):
        let snapshot = snapshot_of(recv(&mut source).await);
        assert_eq!(snapshot.room.room_id, "room-origin");
        assert_eq!(snapshot.room.join_code, code);
        assert_eq!(snapshot.room.members.len(), 2);
        assert_eq!(
            snapshot.room.member("dev-b").map(|m| m.client_id.as_str()),
            Some(client_id.as_str())
        );
        assert_eq!(
            snapshot.room.chat.front().map(|e| e.text.as_str()),
            Some("before the crash")
        );
        assert_eq!(snapshot.device_to_client.get("dev-b"), Some(&client_id));
        handle.stop().await;
    }
}
