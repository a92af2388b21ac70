// Local identity resolution and sent/received classification

use log::{info, warn};

use crate::error::ClientError;
use crate::models::{Message, Origin};
use crate::sync::http::ChatApi;

/// The client's own address as seen by the server.
///
/// Starts `Unknown` and is set at most once per session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LocalIdentity {
    #[default]
    Unknown,
    Known(String),
}

impl LocalIdentity {
    pub fn as_known(&self) -> Option<&str> {
        match self {
            LocalIdentity::Known(host) => Some(host),
            LocalIdentity::Unknown => None,
        }
    }
}

/// Strategy for deciding whether a message came from this client.
pub trait OriginClassifier {
    fn classify(&self, message: &Message) -> Origin;
}

/// Exact match of the sender's host segment against the resolved identity.
impl OriginClassifier for LocalIdentity {
    fn classify(&self, message: &Message) -> Origin {
        match self {
            LocalIdentity::Known(own) if sender_host(&message.sender_endpoint) == own.as_str() => Origin::Sent,
            _ => Origin::Received,
        }
    }
}

/// Host segment of a sender endpoint.
///
/// `host:port` yields the text before the `:`. Bracketed IPv6 literals (`[::1]:80`)
/// yield the address inside the brackets, and a bare IPv6 address (more than one `:`,
/// no brackets) is already a host and comes back whole.
pub fn sender_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match endpoint.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => endpoint,
    }
}

pub struct IdentityResolver;

impl IdentityResolver {
    /// Ask the server who we are, once. Any failure degrades to `Unknown`.
    pub async fn resolve(api: &dyn ChatApi) -> LocalIdentity {
        match Self::try_resolve(api).await {
            Ok(identity) => {
                info!("Resolved local identity: {:?}", identity);
                identity
            }
            Err(e) => {
                warn!("{}; messages will be shown as received", e);
                LocalIdentity::Unknown
            }
        }
    }

    async fn try_resolve(api: &dyn ChatApi) -> Result<LocalIdentity, ClientError> {
        let response = api
            .my_ip()
            .await
            .map_err(|e| ClientError::IdentityUnavailable(e.to_string()))?;

        let host = sender_host(response.ip.trim()).to_string();
        if host.is_empty() {
            return Err(ClientError::IdentityUnavailable("server returned an empty address".to_string()));
        }
        Ok(LocalIdentity::Known(host))
    }
}
