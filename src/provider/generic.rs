//! Generic OpenAI-compatible provider: the OpenAI dialect pointed at a
//! configured base URL. Covers self-hosted servers and third-party gateways
//! that speak chat/completions.

use async_trait::async_trait;

use crate::api::ChatCompletionRequest;
use crate::provider::openai::OpenAiAdapter;
use crate::provider::{AdapterError, AdapterReply, ProviderAdapter};

pub struct GenericAdapter {
    inner: OpenAiAdapter,
}

impl GenericAdapter {
    pub fn new(
        name: &str,
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        timeout_ms: u64,
    ) -> Self {
        Self {
            inner: OpenAiAdapter::new(name, client, base_url, api_key, timeout_ms),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GenericAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
    ) -> Result<AdapterReply, AdapterError> {
        self.inner.execute(request, upstream_model).await
    }
}
