//! Error taxonomy for the sync client.
//!
//! Transport and parse faults are contained inside the connection manager and only
//! ever drive reconnection or get logged. Request faults belong to a user action and
//! are surfaced to the user. Nothing here is fatal to the client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The live stream dropped or failed to open
    #[error("Transport failure: {0}")]
    Transport(String),

    /// An inbound stream payload could not be decoded
    #[error("Malformed stream payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// A send, upload or download exchange failed
    #[error("{action} failed: {reason}")]
    Request {
        action: String,
        reason: RequestFailure,
    },

    /// Local identity could not be resolved; classification degrades to "received"
    #[error("Local identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn request(action: impl Into<String>, reason: RequestFailure) -> Self {
        ClientError::Request {
            action: action.into(),
            reason,
        }
    }

    /// Whether this error should be shown to the user rather than only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, ClientError::Request { .. } | ClientError::Config(_) | ClientError::Io(_))
    }
}

/// Why a single HTTP exchange failed.
#[derive(Debug, Error)]
pub enum RequestFailure {
    #[error("server returned status {0}")]
    Status(u16),

    #[error("server reported the request as unsuccessful")]
    Rejected,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("cannot read local file: {0}")]
    LocalFile(String),
}

impl From<reqwest::Error> for RequestFailure {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            RequestFailure::Status(status.as_u16())
        } else if err.is_decode() {
            RequestFailure::InvalidResponse(err.to_string())
        } else {
            RequestFailure::Network(err.to_string())
        }
    }
}
