use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One entry of the shared message log, as delivered by the server.
///
/// Records are created by the server and never edited on the client. `id` is the
/// dedup key: a visible log holds at most one entry per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    /// Text body, or the display name of the attached file.
    pub content: String,
    /// `host:port` of the sender as seen by the server.
    pub sender_endpoint: String,
    /// Opaque server acceptance time; never used for ordering.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Text,
    File(FileReference),
}

/// Download token plus declared size of a file message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub token: String,
    pub size: u64,
}

impl Message {
    pub fn file_reference(&self) -> Option<&FileReference> {
        match &self.kind {
            MessageKind::File(file) => Some(file),
            MessageKind::Text => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, MessageKind::File(_))
    }
}

// Field names as transmitted: `type`, `sender_ip`, plus `filename`/`filesize` for files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
    sender_ip: String,
    timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filesize: Option<u64>,
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kind = match wire.kind.as_str() {
            "text" => MessageKind::Text,
            "file" => {
                let token = wire
                    .filename
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| format!("file message {} has no filename", wire.id))?;
                MessageKind::File(FileReference {
                    token,
                    size: wire.filesize.unwrap_or(0),
                })
            }
            other => return Err(format!("unknown message type '{}'", other)),
        };

        Ok(Message {
            id: wire.id,
            kind,
            content: wire.content,
            sender_endpoint: wire.sender_ip,
            timestamp: wire.timestamp,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let (kind, filename, filesize) = match message.kind {
            MessageKind::Text => ("text".to_string(), None, None),
            MessageKind::File(file) => ("file".to_string(), Some(file.token), Some(file.size)),
        };
        WireMessage {
            id: message.id,
            kind,
            content: message.content,
            sender_ip: message.sender_endpoint,
            timestamp: message.timestamp,
            filename,
            filesize,
        }
    }
}

/// Lifecycle of the live stream. One instance per client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    /// Status indicator text.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Connected",
            ConnectionState::Closed => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Presentation-only classification of a message relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Sent,
    Received,
}

// HTTP response bodies

#[derive(Debug, Clone, Deserialize)]
pub struct SendTextResponse {
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MyIpResponse {
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub resources_loaded: Option<u64>,
    #[serde(default)]
    pub total_messages: Option<u64>,
    #[serde(default)]
    pub temp_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageHistory {
    #[serde(deserialize_with = "skip_bad_records")]
    pub messages: Vec<Message>,
}

/// Decode a list of message records, dropping the ones that do not decode.
///
/// The list itself must still be a JSON array.
pub(crate) fn skip_bad_records<'de, D>(deserializer: D) -> Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let records = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let total = records.len();
    let messages: Vec<Message> = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Message>(record) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping undecodable message record: {}", e);
                None
            }
        })
        .collect();
    if messages.len() < total {
        warn!("Kept {} of {} message records", messages.len(), total);
    }
    Ok(messages)
}
