// Common test utilities for integration tests
// Logger setup, an in-memory ChatApi, a recording render sink and a scripted connector

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures_util::StreamExt;
use log::LevelFilter;
use tokio::sync::mpsc;

use autosync::error::RequestFailure;
use autosync::models::{
    FileReference, Message, MessageHistory, MessageKind, MyIpResponse, SendTextResponse, ServerStatus, UploadResponse,
};
use autosync::sync::{ChatApi, Connector, DownloadBody, RenderSink, RenderedMessage, TransportEvent};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub fn text_message(id: &str, content: &str, sender: &str) -> Message {
    Message {
        id: id.to_string(),
        kind: MessageKind::Text,
        content: content.to_string(),
        sender_endpoint: sender.to_string(),
        timestamp: "2024-05-01 10:00:00.000".to_string(),
    }
}

pub fn file_message(id: &str, name: &str, token: &str, size: u64) -> Message {
    Message {
        id: id.to_string(),
        kind: MessageKind::File(FileReference {
            token: token.to_string(),
            size,
        }),
        content: name.to_string(),
        sender_endpoint: "10.0.0.5:51000".to_string(),
        timestamp: "2024-05-01 10:00:00.000".to_string(),
    }
}

/// Render sink that records every call, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
    pub visible: Vec<RenderedMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Clear,
    Upsert(String),
}

impl RecordingSink {
    pub fn contents(&self) -> Vec<String> {
        self.visible.iter().map(|e| e.message.content.clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.visible.iter().map(|e| e.message.id.clone()).collect()
    }
}

impl RenderSink for RecordingSink {
    fn clear(&mut self) {
        self.calls.push(SinkCall::Clear);
        self.visible.clear();
    }

    fn upsert(&mut self, entry: RenderedMessage) {
        self.calls.push(SinkCall::Upsert(entry.message.id.clone()));
        match self.visible.iter_mut().find(|e| e.message.id == entry.message.id) {
            Some(existing) => *existing = entry,
            None => self.visible.push(entry),
        }
    }
}

/// In-memory stand-in for the server's HTTP surface.
#[derive(Default)]
pub struct MockApi {
    pub sent_texts: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    /// Uploads of these file names answer with the given status
    pub upload_failures: Mutex<HashMap<String, u16>>,
    pub send_failure: Mutex<Option<RequestFailure>>,
    pub reject_sends: Mutex<bool>,
    pub my_ip: Mutex<Option<String>>,
    /// token -> chunks; a `None` chunk makes the body fail at that point
    pub files: Mutex<HashMap<String, Vec<Option<Vec<u8>>>>>,
    pub declare_length: Mutex<bool>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_ip(ip: &str) -> Arc<Self> {
        let api = Self::default();
        *api.my_ip.lock().unwrap() = Some(ip.to_string());
        Arc::new(api)
    }

    pub fn fail_upload(&self, file_name: &str, status: u16) {
        self.upload_failures.lock().unwrap().insert(file_name.to_string(), status);
    }

    pub fn add_file(&self, token: &str, chunks: Vec<Option<Vec<u8>>>) {
        self.files.lock().unwrap().insert(token.to_string(), chunks);
    }

    pub fn send_count(&self) -> usize {
        self.sent_texts.lock().unwrap().len()
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploads.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn send_text(&self, text: &str) -> Result<SendTextResponse, RequestFailure> {
        self.sent_texts.lock().unwrap().push(text.to_string());
        if let Some(failure) = self.send_failure.lock().unwrap().take() {
            return Err(failure);
        }
        let success = !*self.reject_sends.lock().unwrap();
        Ok(SendTextResponse {
            success,
            message_id: success.then(|| format!("id_{}", self.send_count())),
        })
    }

    async fn upload(&self, file_name: &str, contents: Vec<u8>) -> Result<UploadResponse, RequestFailure> {
        if let Some(status) = self.upload_failures.lock().unwrap().get(file_name) {
            return Err(RequestFailure::Status(*status));
        }
        self.uploads.lock().unwrap().push((file_name.to_string(), contents));
        Ok(UploadResponse {
            success: true,
            filename: Some(format!("1714_000001_{}", file_name)),
            message_id: Some("up_1".to_string()),
        })
    }

    async fn download(&self, token: &str) -> Result<DownloadBody, RequestFailure> {
        let chunks = self
            .files
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(RequestFailure::Status(404))?;

        let total = if *self.declare_length.lock().unwrap() {
            Some(chunks.iter().flatten().map(|c| c.len() as u64).sum())
        } else {
            None
        };
        let body = stream::iter(chunks.into_iter().map(|chunk| match chunk {
            Some(bytes) => Ok(Bytes::from(bytes)),
            None => Err(RequestFailure::Network("connection reset".to_string())),
        }))
        .boxed();

        Ok(DownloadBody { total, chunks: body })
    }

    async fn my_ip(&self) -> Result<MyIpResponse, RequestFailure> {
        match self.my_ip.lock().unwrap().clone() {
            Some(ip) => Ok(MyIpResponse { ip }),
            None => Err(RequestFailure::Status(500)),
        }
    }

    async fn status(&self) -> Result<ServerStatus, RequestFailure> {
        Ok(ServerStatus {
            status: "running".to_string(),
            message: None,
            resources_loaded: None,
            total_messages: Some(0),
            temp_dir: None,
        })
    }

    async fn messages(&self) -> Result<MessageHistory, RequestFailure> {
        Ok(MessageHistory { messages: Vec::new() })
    }
}

/// Connector that only records which sessions were opened. Tests drive the
/// session events by hand through `ConnectionManager::handle`.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub opened: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedConnector {
    pub fn opened(&self) -> Vec<u64> {
        self.opened.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, _url: &str, session: u64, _events: mpsc::UnboundedSender<TransportEvent>) {
        self.opened.lock().unwrap().push(session);
    }
}

/// Connector that fails every attempt right away, like a server that is down.
#[derive(Clone, Default)]
pub struct RefusingConnector {
    pub attempts: Arc<Mutex<u64>>,
}

impl Connector for RefusingConnector {
    fn open(&self, _url: &str, session: u64, events: mpsc::UnboundedSender<TransportEvent>) {
        *self.attempts.lock().unwrap() += 1;
        let _ = events.send(TransportEvent::Failed {
            session,
            reason: "connection refused".to_string(),
        });
        let _ = events.send(TransportEvent::Closed { session });
    }
}
