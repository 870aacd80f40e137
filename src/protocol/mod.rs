//! Wire codec for the coordinator protocol.
//!
//! Frames are UTF-8 JSON objects `{type, requestId, clientId, payload}` on a
//! reliable ordered transport. The frame set is a closed tagged union: the
//! decoder returns `Ok(Frame)` or `Err(MalformedFrame)`, never an
//! unconstrained map. Decode failures are reported back to the sender via an
//! ERROR frame and the offending frame is dropped; they never abort the
//! process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::room::Snapshot;

/// `clientId` used by coordinator-originated frames.
pub const SERVER_CLIENT_ID: &str = "server";
/// `clientId` used by a peer before WELCOME assigns one.
pub const PENDING_CLIENT_ID: &str = "pending";

/// Reasons a frame fails to decode.
#[derive(Debug, Error)]
pub enum MalformedFrame {
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no `type` field")]
    MissingType,

    #[error("unknown frame type '{0}'")]
    UnknownType(String),

    #[error("`requestId` is missing or not a string")]
    BadRequestId,

    #[error("`payload` is present but not an object")]
    PayloadNotObject,

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// One decoded frame: envelope identity plus the typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: String,
    pub client_id: String,
    pub body: FrameBody,
}

/// The closed set of frame payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// C->S: introduce the device behind this connection.
    Hello { device_id: String, name: String },
    /// S->C: connection identity assigned by the coordinator.
    Welcome { client_id: String },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    /// S->C: per-request failure; `code` is a stable machine-readable tag.
    Error { reason: String, code: Option<String> },
    CreateRoom {
        room_name: Option<String>,
        max_players: Option<u32>,
    },
    JoinRoom { join_code: String },
    LeaveRoom,
    /// C->S: send a chat line to the sender's room.
    Chat { text: String },
    /// S->C broadcast: a chat line for real-time display.
    ChatBroadcast {
        from_device_id: String,
        from_name: String,
        text: String,
        timestamp: i64,
    },
    Kick { target_device_id: String },
    Kicked { reason: String },
    /// S->C broadcast: the full replicated room state.
    StateSnapshot { snapshot: Snapshot },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloPayload {
    device_id: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WelcomePayload {
    client_id: String,
}

#[derive(Serialize, Deserialize)]
struct TimestampPayload {
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    room_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_players: Option<u32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomPayload {
    join_code: String,
}

#[derive(Serialize, Deserialize)]
struct ChatPayload {
    text: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBroadcastPayload {
    from_device_id: String,
    from_name: String,
    text: String,
    timestamp: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickPayload {
    target_device_id: String,
}

#[derive(Serialize, Deserialize)]
struct KickedPayload {
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    snapshot: Snapshot,
}

impl FrameBody {
    /// The wire `type` string of this body.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::Hello { .. } => "HELLO",
            FrameBody::Welcome { .. } => "WELCOME",
            FrameBody::Ping { .. } => "PING",
            FrameBody::Pong { .. } => "PONG",
            FrameBody::Error { .. } => "ERROR",
            FrameBody::CreateRoom { .. } => "CREATE_ROOM",
            FrameBody::JoinRoom { .. } => "JOIN_ROOM",
            FrameBody::LeaveRoom => "LEAVE_ROOM",
            FrameBody::Chat { .. } | FrameBody::ChatBroadcast { .. } => "CHAT",
            FrameBody::Kick { .. } => "KICK",
            FrameBody::Kicked { .. } => "KICKED",
            FrameBody::StateSnapshot { .. } => "STATE_SNAPSHOT",
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            FrameBody::Hello { device_id, name } => to_payload(&HelloPayload {
                device_id: device_id.clone(),
                name: name.clone(),
            }),
            FrameBody::Welcome { client_id } => to_payload(&WelcomePayload {
                client_id: client_id.clone(),
            }),
            FrameBody::Ping { timestamp } | FrameBody::Pong { timestamp } => {
                to_payload(&TimestampPayload {
                    timestamp: *timestamp,
                })
            }
            FrameBody::Error { reason, code } => to_payload(&ErrorPayload {
                reason: reason.clone(),
                code: code.clone(),
            }),
            FrameBody::CreateRoom {
                room_name,
                max_players,
            } => to_payload(&CreateRoomPayload {
                room_name: room_name.clone(),
                max_players: *max_players,
            }),
            FrameBody::JoinRoom { join_code } => to_payload(&JoinRoomPayload {
                join_code: join_code.clone(),
            }),
            FrameBody::LeaveRoom => Value::Object(Map::new()),
            FrameBody::Chat { text } => to_payload(&ChatPayload { text: text.clone() }),
            FrameBody::ChatBroadcast {
                from_device_id,
                from_name,
                text,
                timestamp,
            } => to_payload(&ChatBroadcastPayload {
                from_device_id: from_device_id.clone(),
                from_name: from_name.clone(),
                text: text.clone(),
                timestamp: *timestamp,
            }),
            FrameBody::Kick { target_device_id } => to_payload(&KickPayload {
                target_device_id: target_device_id.clone(),
            }),
            FrameBody::Kicked { reason } => to_payload(&KickedPayload {
                reason: reason.clone(),
            }),
            FrameBody::StateSnapshot { snapshot } => to_payload(&SnapshotPayload {
                snapshot: snapshot.clone(),
            }),
        }
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("payload serialization cannot fail")
}

impl Frame {
    /// A coordinator-originated frame.
    pub fn server(request_id: impl Into<String>, body: FrameBody) -> Self {
        Frame {
            request_id: request_id.into(),
            client_id: SERVER_CLIENT_ID.to_string(),
            body,
        }
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> String {
        let envelope = json!({
            "type": self.body.kind(),
            "requestId": self.request_id,
            "clientId": self.client_id,
            "payload": self.body.payload_value(),
        });
        envelope.to_string()
    }

    /// Parse a wire frame. Fails with [`MalformedFrame`] on any shape error.
    pub fn decode(text: &str) -> Result<Frame, MalformedFrame> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| MalformedFrame::NotAnObject)?;
        let obj = value.as_object().ok_or(MalformedFrame::NotAnObject)?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedFrame::MissingType)?;
        let request_id = obj
            .get("requestId")
            .and_then(Value::as_str)
            .ok_or(MalformedFrame::BadRequestId)?
            .to_string();
        let client_id = obj
            .get("clientId")
            .and_then(Value::as_str)
            .unwrap_or(PENDING_CLIENT_ID)
            .to_string();
        let payload = match obj.get("payload") {
            None => Value::Object(Map::new()),
            Some(value) if value.is_object() => value.clone(),
            Some(_) => return Err(MalformedFrame::PayloadNotObject),
        };

        let body = match kind {
            "HELLO" => {
                let p: HelloPayload = from_payload("HELLO", payload)?;
                FrameBody::Hello {
                    device_id: p.device_id,
                    name: p.name,
                }
            }
            "WELCOME" => {
                let p: WelcomePayload = from_payload("WELCOME", payload)?;
                FrameBody::Welcome {
                    client_id: p.client_id,
                }
            }
            "PING" => {
                let p: TimestampPayload = from_payload("PING", payload)?;
                FrameBody::Ping {
                    timestamp: p.timestamp,
                }
            }
            "PONG" => {
                let p: TimestampPayload = from_payload("PONG", payload)?;
                FrameBody::Pong {
                    timestamp: p.timestamp,
                }
            }
            "ERROR" => {
                let p: ErrorPayload = from_payload("ERROR", payload)?;
                FrameBody::Error {
                    reason: p.reason,
                    code: p.code,
                }
            }
            "CREATE_ROOM" => {
                let p: CreateRoomPayload = from_payload("CREATE_ROOM", payload)?;
                FrameBody::CreateRoom {
                    room_name: p.room_name,
                    max_players: p.max_players,
                }
            }
            "JOIN_ROOM" => {
                let p: JoinRoomPayload = from_payload("JOIN_ROOM", payload)?;
                FrameBody::JoinRoom {
                    join_code: p.join_code,
                }
            }
            "LEAVE_ROOM" => FrameBody::LeaveRoom,
            // The broadcast form carries `fromDeviceId`; the client form
            // carries only `text`.
            "CHAT" => {
                if payload.get("fromDeviceId").is_some() {
                    let p: ChatBroadcastPayload = from_payload("CHAT", payload)?;
                    FrameBody::ChatBroadcast {
                        from_device_id: p.from_device_id,
                        from_name: p.from_name,
                        text: p.text,
                        timestamp: p.timestamp,
                    }
                } else {
                    let p: ChatPayload = from_payload("CHAT", payload)?;
                    FrameBody::Chat { text: p.text }
                }
            }
            "KICK" => {
                let p: KickPayload = from_payload("KICK", payload)?;
                FrameBody::Kick {
                    target_device_id: p.target_device_id,
                }
            }
            "KICKED" => {
                let p: KickedPayload = from_payload("KICKED", payload)?;
                FrameBody::Kicked { reason: p.reason }
            }
            "STATE_SNAPSHOT" => {
                let p: SnapshotPayload = from_payload("STATE_SNAPSHOT", payload)?;
                FrameBody::StateSnapshot {
                    snapshot: p.snapshot,
                }
            }
            other => return Err(MalformedFrame::UnknownType(other.to_string())),
        };

        Ok(Frame {
            request_id,
            client_id,
            body,
        })
    }
}

fn from_payload<T: for<'de> Deserialize<'de>>(
    kind: &'static str,
    payload: Value,
) -> Result<T, MalformedFrame> {
    serde_json::from_value(payload).map_err(|source| MalformedFrame::Payload { kind, source })
}

/// Best-effort `requestId` extraction from raw text, for ERROR replies to
/// frames that failed to decode.
pub fn request_id_of(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        // テスト項目: 各フレーム種別がエンコード・デコードを往復しても等しい
        // given (前提条件) / when (操作) / then (期待する結果):
        round_trip(Frame {
            request_id: "req-1".to_string(),
            client_id: PENDING_CLIENT_ID.to_string(),
            body: FrameBody::Hello {
                device_id: "dev-a".to_string(),
                name: "Alice".to_string(),
            },
        });
        round_trip(Frame::server(
            "req-2",
            FrameBody::Welcome {
                client_id: "client-1".to_string(),
            },
        ));
        round_trip(Frame::server("req-3", FrameBody::Ping { timestamp: 17 }));
        round_trip(Frame {
            request_id: "req-4".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::Pong { timestamp: 17 },
        });
        round_trip(Frame::server(
            "req-5",
            FrameBody::Error {
                reason: "NAME_CONFLICT: name taken".to_string(),
                code: Some("NAME_CONFLICT".to_string()),
            },
        ));
        round_trip(Frame {
            request_id: "req-6".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::CreateRoom {
                room_name: Some("den".to_string()),
                max_players: None,
            },
        });
        round_trip(Frame {
            request_id: "req-7".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::JoinRoom {
                join_code: "X7QK2P".to_string(),
            },
        });
        round_trip(Frame {
            request_id: "req-8".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::LeaveRoom,
        });
        round_trip(Frame {
            request_id: "req-9".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::Kick {
                target_device_id: "dev-b".to_string(),
            },
        });
        round_trip(Frame::server(
            "req-10",
            FrameBody::Kicked {
                reason: "kicked by host".to_string(),
            },
        ));
    }

    #[test]
    fn test_chat_forms_are_disambiguated_by_payload() {
        // テスト項目: CHAT はペイロード形状でクライアント形とブロードキャスト形に分かれる
        // given (前提条件):
        let client_chat = Frame {
            request_id: "req-1".to_string(),
            client_id: "client-1".to_string(),
            body: FrameBody::Chat {
                text: "hi".to_string(),
            },
        };
        let broadcast = Frame::server(
            "req-2",
            FrameBody::ChatBroadcast {
                from_device_id: "dev-b".to_string(),
                from_name: "Bob".to_string(),
                text: "hi".to_string(),
                timestamp: 99,
            },
        );

        // when (操作):
        let decoded_client = Frame::decode(&client_chat.encode()).expect("decode");
        let decoded_broadcast = Frame::decode(&broadcast.encode()).expect("decode");

        // then (期待する結果):
        assert!(matches!(decoded_client.body, FrameBody::Chat { .. }));
        assert!(matches!(decoded_broadcast.body, FrameBody::ChatBroadcast { .. }));
    }

    #[test]
    fn test_snapshot_frame_round_trip() {
        // テスト項目: スナップショットを含むフレームが往復しても等しい
        // given (前提条件):
        let mut registry = crate::room::RoomRegistry::new();
        registry.create_room(
            "room-1".to_string(),
            "dev-a".to_string(),
            "client-1".to_string(),
            "Alice".to_string(),
        );
        let snapshot = registry.make_snapshot("room-1").expect("snapshot");

        // when (操作) / then (期待する結果):
        round_trip(Frame::server("req-1", FrameBody::StateSnapshot { snapshot }));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        // テスト項目: オブジェクトでない入力は NotAnObject で失敗する
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(matches!(
            Frame::decode("[1,2,3]"),
            Err(MalformedFrame::NotAnObject)
        ));
        assert!(matches!(
            Frame::decode("not json"),
            Err(MalformedFrame::NotAnObject)
        ));
    }

    #[test]
    fn test_decode_rejects_missing_or_unknown_type() {
        // テスト項目: type の欠落・未知の type は失敗する
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(matches!(
            Frame::decode(r#"{"requestId":"r1"}"#),
            Err(MalformedFrame::MissingType)
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"TELEPORT","requestId":"r1"}"#),
            Err(MalformedFrame::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_request_id() {
        // テスト項目: requestId の欠落・非文字列は失敗する
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(matches!(
            Frame::decode(r#"{"type":"LEAVE_ROOM"}"#),
            Err(MalformedFrame::BadRequestId)
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"LEAVE_ROOM","requestId":7}"#),
            Err(MalformedFrame::BadRequestId)
        ));
    }

    #[test]
    fn test_decode_rejects_non_object_payload() {
        // テスト項目: payload が存在してオブジェクトでない場合は失敗する
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(matches!(
            Frame::decode(r#"{"type":"LEAVE_ROOM","requestId":"r1","payload":"x"}"#),
            Err(MalformedFrame::PayloadNotObject)
        ));
        assert!(matches!(
            Frame::decode(r#"{"type":"LEAVE_ROOM","requestId":"r1","payload":null}"#),
            Err(MalformedFrame::PayloadNotObject)
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_payload_shape() {
        // テスト項目: type に対して形が合わない payload は失敗する
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(matches!(
            Frame::decode(r#"{"type":"HELLO","requestId":"r1","payload":{"deviceId":"d"}}"#),
            Err(MalformedFrame::Payload { kind: "HELLO", .. })
        ));
    }

    #[test]
    fn test_decode_defaults_missing_client_id_to_pending() {
        // テスト項目: clientId が無いフレームは pending として扱われる
        // given (前提条件):
        let text = r#"{"type":"PING","requestId":"r1","payload":{"timestamp":5}}"#;

        // when (操作):
        let frame = Frame::decode(text).expect("decode");

        // then (期待する結果):
        assert_eq!(frame.client_id, PENDING_CLIENT_ID);
    }

    #[test]
    fn test_request_id_extraction_from_malformed_text() {
        // テスト項目: デコード不能なフレームからも requestId を回収できる
        // given (前提条件):
        let text = r#"{"type":"TELEPORT","requestId":"r9","payload":{}}"#;

        // when (操作):
        let request_id = request_id_of(text);

        // then (期待する結果):
        assert_eq!(request_id.as_deref(), Some("r9"));
        assert_eq!(request_id_of("garbage"), None);
    }
}
