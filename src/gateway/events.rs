use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::Clock;

/// Current envelope version. Envelopes with any other version are rejected.
pub const ENVELOPE_VERSION: u8 = 1;

/// Commands the relay may send upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "sendMessage")]
    SendMessage,
    #[serde(rename = "editMessage")]
    EditMessage,
    #[serde(rename = "deleteMessage")]
    DeleteMessage,
    #[serde(rename = "joinVoice")]
    JoinVoice,
    #[serde(rename = "leaveVoice")]
    LeaveVoice,
    #[serde(rename = "updatePresence")]
    UpdatePresence,
}

/// Events relayed from upstream or the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "message.updated")]
    MessageUpdated,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "voice.joined")]
    VoiceJoined,
    #[serde(rename = "voice.left")]
    VoiceLeft,
    #[serde(rename = "voice.state_update")]
    VoiceStateUpdate,
    #[serde(rename = "member.joined")]
    MemberJoined,
    #[serde(rename = "member.left")]
    MemberLeft,
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    #[serde(rename = "room.updated")]
    RoomUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(rename = "traceId")]
    trace_id: String,
    #[serde(rename = "sentAt")]
    sent_at: u64,
}

/// Versioned, immutable envelope shared by commands and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<K> {
    version: u8,
    #[serde(rename = "type")]
    kind: K,
    data: serde_json::Value,
    meta: EnvelopeMeta,
}

pub type GatewayCommand = Envelope<CommandType>;
pub type GatewayEvent = Envelope<EventType>;

impl<K: Copy> Envelope<K> {
    /// Build an envelope with a fresh trace id, stamped at `sent_at` (ms).
    pub fn with_sent_at(kind: K, data: serde_json::Value, sent_at: u64) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind,
            data,
            meta: EnvelopeMeta {
                trace_id: uuid::Uuid::new_v4().to_string(),
                sent_at,
            },
        }
    }

    pub fn new(kind: K, data: serde_json::Value, clock: &dyn Clock) -> Self {
        Self::with_sent_at(kind, data, clock.now_ms())
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn kind(&self) -> K {
        self.kind
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn trace_id(&self) -> &str {
        &self.meta.trace_id
    }

    pub fn sent_at(&self) -> u64 {
        self.meta.sent_at
    }
}

/// Body of an inbound event, shared by gateway `event` frames and webhook
/// submissions: `{ "event": "<type>", "payload": { ... } }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBody {
    /// Optional; when present it must equal [`ENVELOPE_VERSION`].
    #[serde(default)]
    pub version: Option<u8>,
    pub event: EventType,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventBody {
    pub fn into_event(self, sent_at: u64) -> GatewayEvent {
        GatewayEvent::with_sent_at(self.event, serde_json::Value::Object(self.payload), sent_at)
    }
}

#[derive(Debug)]
pub enum EventParseError {
    /// Not JSON at all.
    Json(String),
    /// JSON, but not a valid event body.
    Schema(String),
}

impl fmt::Display for EventParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventParseError::Json(e) => write!(f, "invalid JSON: {e}"),
            EventParseError::Schema(e) => write!(f, "invalid event: {e}"),
        }
    }
}

impl std::error::Error for EventParseError {}

/// Validate raw bytes against the event body schema.
pub fn parse_event_body(bytes: &[u8]) -> Result<EventBody, EventParseError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| EventParseError::Json(e.to_string()))?;
    validate_event_body(value)
}

pub fn validate_event_body(value: serde_json::Value) -> Result<EventBody, EventParseError> {
    let body: EventBody =
        serde_json::from_value(value).map_err(|e| EventParseError::Schema(e.to_string()))?;
    match body.version {
        Some(v) if v != ENVELOPE_VERSION => Err(EventParseError::Schema(format!(
            "unsupported version {v}"
        ))),
        _ => Ok(body),
    }
}

/// Frame kinds on the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Event,
    Command,
    Ack,
    Error,
}

/// Wire envelope used in both directions on the upstream socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub data: serde_json::Value,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ts: u64,
}

impl WireFrame {
    pub fn command(request_id: &str, command: &GatewayCommand, ts: u64) -> Self {
        Self {
            kind: FrameKind::Command,
            data: serde_json::to_value(command).expect("command envelopes always serialize"),
            request_id: Some(request_id.to_string()),
            ts,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("wire frames always serialize")
    }
}
