// HTTP surface consumed by the client
// ChatApi is the seam; HttpApi is the reqwest-backed implementation

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ClientError, RequestFailure};
use crate::models::{MessageHistory, MyIpResponse, SendTextResponse, ServerStatus, UploadResponse};
use crate::sync::api_paths;

/// A download response: declared length (if any) and the body as a chunk stream.
pub struct DownloadBody {
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, RequestFailure>>,
}

/// Request/response exchanges with the server, independent of the live stream.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<SendTextResponse, RequestFailure>;

    async fn upload(&self, file_name: &str, contents: Vec<u8>) -> Result<UploadResponse, RequestFailure>;

    async fn download(&self, token: &str) -> Result<DownloadBody, RequestFailure>;

    async fn my_ip(&self) -> Result<MyIpResponse, RequestFailure>;

    async fn status(&self) -> Result<ServerStatus, RequestFailure>;

    async fn messages(&self) -> Result<MessageHistory, RequestFailure>;
}

pub struct HttpApi {
    client: Client,
    base: Url,
}

impl HttpApi {
    pub fn new(base: Url) -> Result<Self, ClientError> {
        let client = Client::builder()
            .user_agent(concat!("autosync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, RequestFailure> {
        self.base
            .join(path)
            .map_err(|e| RequestFailure::InvalidResponse(format!("bad endpoint {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestFailure> {
        let url = self.endpoint(path)?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        decode(response).await
    }
}

// Non-success status is a failure regardless of body
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RequestFailure> {
    let response = check_status(response)?;
    response
        .json::<T>()
        .await
        .map_err(|e| RequestFailure::InvalidResponse(e.to_string()))
}

fn check_status(response: Response) -> Result<Response, RequestFailure> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RequestFailure::Status(status.as_u16()))
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn send_text(&self, text: &str) -> Result<SendTextResponse, RequestFailure> {
        let url = self.endpoint(api_paths::SEND_TEXT)?;
        debug!("POST {} ({} chars)", url, text.len());
        let response = self.client.post(url).json(&json!({ "text": text })).send().await?;
        decode(response).await
    }

    async fn upload(&self, file_name: &str, contents: Vec<u8>) -> Result<UploadResponse, RequestFailure> {
        let url = self.endpoint(api_paths::UPLOAD)?;
        debug!("POST {} ({}, {} bytes)", url, file_name, contents.len());
        let part = Part::bytes(contents).file_name(file_name.to_string());
        let form = Form::new().part("file", part);
        let response = self.client.post(url).multipart(form).send().await?;
        decode(response).await
    }

    async fn download(&self, token: &str) -> Result<DownloadBody, RequestFailure> {
        let mut url = self.endpoint(api_paths::DOWNLOAD)?;
        url.path_segments_mut()
            .map_err(|_| RequestFailure::InvalidResponse("server URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(token);
        debug!("GET {}", url);

        let response = check_status(self.client.get(url).send().await?)?;
        let total = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RequestFailure::from))
            .boxed();
        Ok(DownloadBody { total, chunks })
    }

    async fn my_ip(&self) -> Result<MyIpResponse, RequestFailure> {
        self.get_json(api_paths::MY_IP).await
    }

    async fn status(&self) -> Result<ServerStatus, RequestFailure> {
        self.get_json(api_paths::STATUS).await
    }

    async fn messages(&self) -> Result<MessageHistory, RequestFailure> {
        self.get_json(api_paths::MESSAGES).await
    }
}
