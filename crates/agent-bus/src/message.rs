use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header fields carried by every [`Message`], independent of its payload.
///
/// `Sync` marks a message that expects exactly one correlated response;
/// `ParentID` on a response identifies the request it answers. See
/// `viaduct::sync_keeper` for how the two fields are used to correlate
/// requests and responses on a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sync: bool,
}

/// The wire envelope exchanged over a Viaduct connection and routed through
/// the local bus.
///
/// `content` is kept as raw JSON (`serde_json::Value`) at this layer: the
/// envelope's shape is fixed by the wire protocol, but its payload varies by
/// `operation`/`resource` and is decoded by the receiving module (for
/// example `devicetwin` decodes it into [`crate::DTMessage`]'s inner
/// `DeviceUpdate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub header: MessageHeader,
    pub operation: String,
    pub resource: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    pub timestamp: i64,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// Builds a fresh message with a random v4 id and the current timestamp
    /// left for the caller to fill in (callers that need a real wall-clock
    /// stamp should use `devicetwin`'s `now_millis` helper, since this crate
    /// has no opinion on time sources).
    pub fn new(group: impl Into<String>, resource: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4().to_string(),
                parent_id: None,
                sync: false,
            },
            operation: operation.into(),
            resource: resource.into(),
            group: group.into(),
            source: String::new(),
            destination: String::new(),
            timestamp: 0,
            content: serde_json::Value::Null,
        }
    }

    /// Builds an `ack` (or error) response correlated to `self` via
    /// `parent_id`, mirroring `model.Message.NewRespByMessage` in the
    /// original source's control-lane handling.
    pub fn new_response(&self, content: serde_json::Value) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4().to_string(),
                parent_id: Some(self.header.id.clone()),
                sync: false,
            },
            operation: self.operation.clone(),
            resource: self.resource.clone(),
            group: self.group.clone(),
            source: self.destination.clone(),
            destination: self.source.clone(),
            timestamp: 0,
            content,
        }
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    /// Overrides the generated id, mainly useful in tests that need to
    /// correlate a specific request/response pair.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.header.id = id.into();
        self
    }
}

/// Minimal base fields threaded through a device update before it is
/// published, matching `dttype.BaseMessage` in the original source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// A device-twin event delivered to `DeviceWorker`'s inbound channel:
/// an action name (`device-updated`, `device-state-update`, ...), the
/// target device identity, and the bus message carrying the payload.
#[derive(Debug, Clone)]
pub struct DTMessage {
    pub action: String,
    pub identity: String,
    pub msg: Message,
}

impl DTMessage {
    pub fn new(action: impl Into<String>, identity: impl Into<String>, msg: Message) -> Self {
        Self {
            action: action.into(),
            identity: identity.into(),
            msg,
        }
    }
}
