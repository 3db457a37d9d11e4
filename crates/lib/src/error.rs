//! Error types for the REST dispatcher and the gateway session.

use std::time::Duration;
use thiserror::Error;

/// A REST call that did not produce a usable body.
#[derive(Debug, Error)]
pub enum HttpError {
    /// 401. The credential is rejected; retrying with it is pointless.
    #[error("unauthorized: the token was rejected")]
    Unauthorized,

    #[error("forbidden ({code}): {message}")]
    Forbidden { code: u64, message: String },

    #[error("not found ({code}): {message}")]
    NotFound { code: u64, message: String },

    /// Any other 4xx except 429.
    #[error("http {status} ({code}): {message}")]
    Client {
        status: u16,
        code: u64,
        message: String,
    },

    /// 5xx after the retry budget ran out.
    #[error("server error {status} after retries")]
    InternalServerError { status: u16 },

    /// 429 after the retry budget ran out.
    #[error("rate limited (global: {global}), retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, global: bool },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HttpError {
    /// True for errors that mean the credential itself is bad.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HttpError::Unauthorized)
    }
}

/// A frame that could not be turned into a gateway payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),

    /// The inflater made no progress on a buffer that ended with the flush marker.
    #[error("inflate stalled on a complete frame")]
    Stalled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat already started")]
    AlreadyStarted,

    #[error("heartbeat stopped")]
    Stopped,
}

/// Gateway session failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("rest: {0}")]
    Http(#[from] HttpError),

    /// Close code 4004 or a 401 during discovery.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A close code that forbids reconnecting with the same settings.
    #[error("gateway closed the session ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("heartbeat: {0}")]
    Heartbeat(#[from] HeartbeatError),
}

impl GatewayError {
    /// Fatal errors end the supervisory loop instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        match self {
            GatewayError::AuthenticationFailed | GatewayError::Closed { .. } => true,
            GatewayError::Http(e) => e.is_unauthorized(),
            _ => false,
        }
    }
}
