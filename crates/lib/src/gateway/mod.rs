//! Gateway: the realtime WebSocket session.
//!
//! Wire types live in `protocol`, frame reassembly and zlib-stream handling in
//! `codec`, the keepalive loop in `heartbeat`, and the state machine with its
//! reconnect supervisor in `session`.

mod codec;
mod heartbeat;
mod protocol;
mod session;

pub use codec::{FrameDecoder, FrameEncoder, ZLIB_SUFFIX};
pub use heartbeat::{Heartbeat, HeartbeatState, PayloadSink};
pub use protocol::{GatewayPayload, Hello, Identify, IdentifyProperties, OpCode, Ready, Resume};
pub use session::{
    classify_close, route_payload, ConnectionState, Directive, Flow, GatewayClient, Session,
    SharedSession, ShutdownHandle,
};
