//! Error types for the proxy request path and the checkpoint engine.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use std::fmt;

/// Errors that can occur while handling an inbound proxy request.
#[derive(Debug)]
pub enum ProxyError {
    /// The client body couldn't be read or parsed as the expected JSON shape.
    ClientRequestMalformed(String),
    /// Upstream responded, but with an error status.
    UpstreamError(StatusCode, String),
    /// The request to upstream couldn't be made at all (DNS, connect, timeout).
    NetworkError(String),
    /// Failed to build the response to send back to the client.
    ResponseBuild(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientRequestMalformed(msg) => write!(f, "malformed request: {msg}"),
            ProxyError::UpstreamError(status, msg) => write!(f, "upstream {status}: {msg}"),
            ProxyError::NetworkError(msg) => write!(f, "network error: {msg}"),
            ProxyError::ResponseBuild(msg) => write!(f, "failed building response: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ProxyError::ClientRequestMalformed(msg) => (StatusCode::BAD_REQUEST, msg),
            ProxyError::UpstreamError(status, msg) => (status, msg),
            ProxyError::NetworkError(msg) => (StatusCode::BAD_GATEWAY, msg),
            ProxyError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!(%status, %message, "proxy request failed");

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

/// Errors raised while running a background checkpoint against upstream.
///
/// Never surfaced directly to the client — `BufferEngine` interprets these
/// to decide whether to retry, back off, or fall back to passthrough.
#[derive(Debug)]
pub enum CheckpointError {
    /// Couldn't reach upstream at all.
    NetworkError(String),
    /// Upstream reached, but returned an error status.
    UpstreamError(StatusCode),
    /// Superseded by a newer checkpoint before it completed; discarded, not a failure.
    Cancelled,
    /// The conversation shrank below the checkpoint threshold before this ran.
    TooSmall,
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::NetworkError(msg) => write!(f, "checkpoint network error: {msg}"),
            CheckpointError::UpstreamError(status) => write!(f, "checkpoint upstream error: {status}"),
            CheckpointError::Cancelled => write!(f, "checkpoint cancelled (superseded)"),
            CheckpointError::TooSmall => write!(f, "conversation below checkpoint threshold"),
        }
    }
}

impl std::error::Error for CheckpointError {}
