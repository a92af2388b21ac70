// Realtime sync module for AutoSync
// Entry point for the live stream, reconciliation and outbound actions

use log::debug;
use reqwest::Url;
use serde::Deserialize;

use crate::error::ClientError;
use crate::models::{skip_bad_records, Message};

pub mod connection;
pub mod dispatcher;
pub mod download;
pub mod http;
pub mod identity;
pub mod reconciler;

pub use connection::{ConnectionManager, Connector, SyncUpdate, TransportEvent, WsConnector};
pub use dispatcher::{Dispatcher, SendOutcome, UploadReceipt};
pub use http::{ChatApi, DownloadBody, HttpApi};
pub use identity::{IdentityResolver, LocalIdentity, OriginClassifier};
pub use reconciler::{Applied, MessageLog, Reconciler, RenderSink, RenderedMessage};

// Server routes
pub mod api_paths {
    pub const STREAM: &str = "/ws";
    pub const SEND_TEXT: &str = "/api/send_text";
    pub const UPLOAD: &str = "/api/upload";
    pub const DOWNLOAD: &str = "/api/download/";
    pub const MY_IP: &str = "/api/my_ip";
    pub const STATUS: &str = "/api/status";
    pub const MESSAGES: &str = "/api/messages";
}

/// Interval between reconnection attempts while the stream is closed.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;

/// Inbound frames on the live stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Full ordered log, sent once per connection. Records that do not decode are
    /// skipped so one bad entry cannot block the rest of the snapshot.
    InitialState {
        #[serde(deserialize_with = "skip_bad_records")]
        messages: Vec<Message>,
    },
    NewMessage { message: Message },
    /// Any type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

/// Decode one text frame from the stream.
pub fn parse_stream_payload(raw: &str) -> Result<StreamEvent, ClientError> {
    let event: StreamEvent = serde_json::from_str(raw)?;
    if event == StreamEvent::Unknown {
        debug!("Ignoring stream payload of unknown type");
    }
    Ok(event)
}

/// Derive the stream endpoint from the server base URL, keeping the secure or
/// insecure flavour of the page scheme.
pub fn stream_url(base: &Url) -> Result<Url, ClientError> {
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ClientError::Config(format!(
                "unsupported server scheme '{}', expected http or https",
                other
            )))
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Config(format!("cannot derive stream URL from {}", base)))?;
    url.set_path(api_paths::STREAM);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Parse a user-supplied server address, defaulting to plain http when no scheme is given.
pub fn parse_server_url(server: &str) -> Result<Url, ClientError> {
    let server = server.trim();
    let candidate = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    };
    Url::parse(&candidate).map_err(|e| ClientError::Config(format!("invalid server URL '{}': {}", server, e)))
}
