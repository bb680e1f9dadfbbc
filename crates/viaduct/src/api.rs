//! Shared vocabulary types for the connection layer: the use-type tag on a
//! stream, and the per-connection state machine.

use std::collections::HashMap;

/// Whether a stream carries framed [`agent_bus::Message`]s or a raw byte
/// duplex.
///
/// Encoded on the wire as a single byte immediately after a stream opens
/// (`message = 1`, `stream = 2`), per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseType {
    Message,
    Stream,
}

impl UseType {
    pub(crate) fn to_wire_byte(self) -> u8 {
        match self {
            UseType::Message => 1,
            UseType::Stream => 2,
        }
    }

    pub(crate) fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(UseType::Message),
            2 => Some(UseType::Stream),
            _ => None,
        }
    }
}

/// Connection-level state machine: `Connecting` -> `Connected` ->
/// `Disconnected`. Only `Connected` permits new writes (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

/// Mutable connection metadata: lifecycle state and the header map
/// exchanged during the handshake (`node_id`, `project_id`, auth headers).
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub state: ConnState,
    pub headers: HashMap<String, String>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            state: ConnState::Connecting,
            headers: HashMap::new(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
