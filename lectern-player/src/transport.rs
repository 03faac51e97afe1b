//! REST side of the player: synthesis requests, audio fetches and the model
//! catalog.

use std::time::Duration;

use async_trait::async_trait;
use lectern_core::{BlockIndex, BlockStatus, ContentKey, DocumentId, JobId, ModelCatalog, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::PlayerConfig;
use crate::error::TransportError;

/// Body of `POST /api/v1/synthesis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    pub voice_slug: String,
    pub user_id: UserId,
}

/// Server answer to a [`BlockRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReceipt {
    pub status: BlockStatus,
    pub content_key: ContentKey,
    pub voice_slug: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDocument {
    pub document_id: DocumentId,
    pub block_count: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Everything the engine needs from the server besides the status channel.
#[async_trait]
pub trait SynthesisTransport: Send + Sync {
    async fn catalog(&self) -> Result<ModelCatalog, TransportError>;

    async fn register_document(&self, blocks: &[String]) -> Result<RegisteredDocument, TransportError>;

    async fn request(&self, request: &BlockRequest) -> Result<RequestReceipt, TransportError>;

    /// `Ok(None)` when the server no longer holds the artifact.
    async fn fetch_audio(&self, content_key: &ContentKey) -> Result<Option<Vec<u8>>, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &PlayerConfig) -> Result<Self, TransportError> {
        Self::with_timeout(&config.api_base_url, config.request_timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        let bytes = response.bytes().await?;
        if status.is_success() {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        Err(error_for_status(status.as_u16(), &bytes))
    }
}

fn error_for_status(status: u16, body: &[u8]) -> TransportError {
    let (code, message) = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(err) => (err.code, err.message),
        Err(_) => (
            format!("HTTP_{}", status),
            String::from_utf8_lossy(body).into_owned(),
        ),
    };
    if (400..500).contains(&status) {
        TransportError::Rejected {
            status,
            code,
            message,
        }
    } else {
        TransportError::Server {
            status,
            message: format!("{}: {}", code, message),
        }
    }
}

#[async_trait]
impl SynthesisTransport for HttpTransport {
    async fn catalog(&self) -> Result<ModelCatalog, TransportError> {
        let response = self.client.get(self.url("/api/v1/models")).send().await?;
        self.parse_response(response).await
    }

    async fn register_document(&self, blocks: &[String]) -> Result<RegisteredDocument, TransportError> {
        let response = self
            .client
            .post(self.url("/api/v1/documents"))
            .json(&serde_json::json!({ "blocks": blocks }))
            .send()
            .await?;
        self.parse_response(response).await
    }

    async fn request(&self, request: &BlockRequest) -> Result<RequestReceipt, TransportError> {
        let response = self
            .client
            .post(self.url("/api/v1/synthesis"))
            .json(request)
            .send()
            .await?;
        self.parse_response(response).await
    }

    async fn fetch_audio(&self, content_key: &ContentKey) -> Result<Option<Vec<u8>>, TransportError> {
        let path = format!("/api/v1/cache/{}", content_key);
        let response = self.client.get(self.url(&path)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response.bytes().await?;
        if status.is_success() {
            Ok(Some(bytes.to_vec()))
        } else {
            Err(error_for_status(status.as_u16(), &bytes))
        }
    }
}
