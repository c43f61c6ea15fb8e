//! Provider adapters. Each adapter owns one upstream dialect end to end:
//! request encoding, buffered response decoding, stream decoding, and error
//! normalization. The rest of the gateway only sees canonical types.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::Stream;
use thiserror::Error;

use crate::api::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::config::{ProviderConfig, ProviderType};
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};

pub mod anthropic;
pub mod gemini;
pub mod generic;
pub mod openai;

pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, AdapterError>> + Send>>;

pub enum AdapterReply {
    Full(ChatCompletionResponse),
    Stream(ChunkStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Network failure, timeout, 408/429 or 5xx. The router may try the next
    /// candidate.
    Transient,
    /// Definitive upstream rejection. Surfaced to the caller as-is, no
    /// failover.
    Rejected(StatusCode),
    /// The upstream answered but the payload did not translate.
    Transform,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
    pub error_type: String,
    pub code: String,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transient,
            message: message.into(),
            error_type: "api_error".to_string(),
            code: "upstream_unavailable".to_string(),
        }
    }

    pub fn rejected(
        status: StatusCode,
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            kind: AdapterErrorKind::Rejected(status),
            message: message.into(),
            error_type: error_type.into(),
            code: code.into(),
        }
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transform,
            message: message.into(),
            error_type: "api_error".to_string(),
            code: "upstream_transform_failed".to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, AdapterErrorKind::Transient)
    }

    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            AdapterErrorKind::Transient => StatusCode::BAD_GATEWAY,
            AdapterErrorKind::Rejected(status) => status,
            AdapterErrorKind::Transform => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Map a transport error into the adapter taxonomy. `extract` pulls a
/// (message, type, code) triple out of the dialect's error body when one is
/// present.
pub(crate) fn classify_upstream_error<F>(err: UpstreamCallError, extract: F) -> AdapterError
where
    F: Fn(&serde_json::Value) -> (Option<String>, Option<String>, Option<String>),
{
    match err.kind {
        UpstreamErrorKind::Network => AdapterError::transient(err.message),
        UpstreamErrorKind::Http => {
            let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
            // A success status here means the upstream accepted the call but
            // sent back a body we could not parse.
            if status.is_success() {
                return AdapterError::transform(err.message);
            }
            if status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error()
            {
                return AdapterError::transient(err.message);
            }
            let parsed = err
                .body
                .as_deref()
                .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok());
            let (message, error_type, code) = match &parsed {
                Some(value) => extract(value),
                None => (None, None, None),
            };
            AdapterError::rejected(
                status,
                message.unwrap_or(err.message),
                error_type.unwrap_or_else(|| "invalid_request_error".to_string()),
                code.unwrap_or_else(|| "upstream_rejected".to_string()),
            )
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// One upstream call. `upstream_model` is the route candidate's model id,
    /// already resolved from the client-facing model name.
    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
    ) -> Result<AdapterReply, AdapterError>;
}

#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider {0} requires base_url")]
    MissingBaseUrl(String),
}

impl AdapterRegistry {
    pub fn from_config(
        client: &reqwest::Client,
        providers: &[ProviderConfig],
        timeout_ms: u64,
    ) -> Result<Self, RegistryError> {
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        for provider in providers {
            let base_url = provider
                .effective_base_url()
                .ok_or_else(|| RegistryError::MissingBaseUrl(provider.id.clone()))?;
            let adapter: Arc<dyn ProviderAdapter> = match provider.provider_type {
                ProviderType::Openai => Arc::new(openai::OpenAiAdapter::new(
                    &provider.id,
                    client.clone(),
                    base_url,
                    provider.api_key.clone(),
                    timeout_ms,
                )),
                ProviderType::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(
                    &provider.id,
                    client.clone(),
                    base_url,
                    provider.api_key.clone(),
                    timeout_ms,
                )),
                ProviderType::Gemini => Arc::new(gemini::GeminiAdapter::new(
                    &provider.id,
                    client.clone(),
                    base_url,
                    provider.api_key.clone(),
                    timeout_ms,
                )),
                ProviderType::Generic => Arc::new(generic::GenericAdapter::new(
                    &provider.id,
                    client.clone(),
                    base_url,
                    provider.api_key.clone(),
                    timeout_ms,
                )),
            };
            adapters.insert(provider.id.clone(), adapter);
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn insert(&mut self, id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(id.into(), adapter);
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }
}
