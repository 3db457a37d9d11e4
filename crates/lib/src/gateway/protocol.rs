//! Gateway payload types: the `{op, d, s, t}` envelope and the handshake bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcodes this client sends or handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 6,
    Reconnect = 7,
    InvalidateSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidateSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// Wire envelope: `{ "op", "d", "s", "t" }`. Field order matches the wire so a
/// compact document re-serializes byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// HEARTBEAT carrying the last sequence (null before the first dispatch).
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, sequence.map(Value::from).unwrap_or(Value::Null))
    }

    pub fn identify(identify: &Identify) -> Self {
        Self::new(OpCode::Identify, to_value(identify))
    }

    pub fn resume(resume: &Resume) -> Self {
        Self::new(OpCode::Resume, to_value(resume))
    }
}

fn to_value<T: Serialize>(v: &T) -> Value {
    // derived Serialize on plain structs with string keys cannot fail
    serde_json::to_value(v).unwrap_or(Value::Null)
}

/// HELLO body.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

/// Connection properties sent with IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "wumpus".to_string(),
            device: "wumpus".to_string(),
        }
    }
}

/// IDENTIFY body.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    /// Per-payload compression; always off, the transport stream is compressed instead.
    pub compress: bool,
    pub large_threshold: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    pub intents: u64,
}

impl std::fmt::Debug for Identify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identify")
            .field("token", &"<redacted>")
            .field("properties", &self.properties)
            .field("large_threshold", &self.large_threshold)
            .field("shard", &self.shard)
            .field("intents", &self.intents)
            .finish()
    }
}

/// RESUME body.
#[derive(Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume")
            .field("token", &"<redacted>")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Fields of READY that the session keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}
