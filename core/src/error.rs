use reqwest::StatusCode;
use serde_json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CourierErr>;

#[derive(Error, Debug)]
pub enum CourierErr {
    /// The SSE stream disconnected or misbehaved after the HTTP handshake
    /// succeeded but before the upstream signalled completion.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// The upstream emitted a `session.error` event mid-stream.
    #[error("agent error: {0}")]
    Agent(String),

    /// The agent server stayed unhealthy past the readiness-queue deadline.
    #[error("agent server did not become ready")]
    UpstreamNotReady,

    /// Unexpected HTTP status code from the agent server.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("no adapter registered for platform: {0}")]
    AdapterNotFound(String),

    /// A platform delivery call failed.
    #[error("adapter call failed: {0}")]
    Adapter(String),

    #[error("config not found or disabled: {0}")]
    ConfigNotFound(String),

    #[error("credential bag could not be opened: {0}")]
    Credentials(String),

    #[error("config store error: {0}")]
    Store(String),

    /// Upstream response did not match the expected shape.
    #[error("unexpected upstream payload: {0}")]
    Protocol(String),

    /// Overall prompt-stream deadline exceeded.
    #[error("timed out waiting for the agent")]
    Timeout,

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
