//! OpenAI chat completions dialect. The wire shape is already canonical, so
//! encoding is a field-by-field projection and stream frames deserialize
//! directly; the adapter's work is auth, stream usage accounting, and making
//! sure every stream ends with exactly one usage-bearing chunk.

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use async_trait::async_trait;
use eventsource_stream::Eventsource;

use crate::api::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Usage};
use crate::provider::{
    AdapterError, AdapterReply, ChunkStream, ProviderAdapter, classify_upstream_error,
};
use crate::upstream::{self, UpstreamAuth};

pub struct OpenAiAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl OpenAiAdapter {
    pub fn new(
        name: &str,
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        timeout_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            client,
            base_url,
            api_key,
            timeout_ms,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
    ) -> Result<AdapterReply, AdapterError> {
        let body = encode_request(request, upstream_model);
        if request.wants_stream() {
            let resp = upstream::post_raw(
                &self.client,
                &self.base_url,
                "/v1/chat/completions",
                UpstreamAuth::Bearer(&self.api_key),
                &body,
                self.timeout_ms,
                &[],
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Stream(decode_stream(resp)))
        } else {
            let value = upstream::post_json(
                &self.client,
                &self.base_url,
                "/v1/chat/completions",
                UpstreamAuth::Bearer(&self.api_key),
                &body,
                self.timeout_ms,
                &[],
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Full(decode_response(&value)?))
        }
    }
}

pub(crate) fn encode_request(request: &ChatCompletionRequest, upstream_model: &str) -> Value {
    let mut body = json!({
        "model": upstream_model,
        "messages": request.messages,
    });
    if request.wants_stream() {
        body["stream"] = json!(true);
        // otherwise the final frame carries no usage
        body["stream_options"] = json!({"include_usage": true});
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(stop) = &request.stop {
        body["stop"] = json!(stop);
    }
    if let Some(user) = &request.user {
        body["user"] = json!(user);
    }
    body
}

pub(crate) fn decode_response(value: &Value) -> Result<ChatCompletionResponse, AdapterError> {
    serde_json::from_value(value.clone())
        .map_err(|err| AdapterError::transform(format!("bad chat completion payload: {}", err)))
}

pub(crate) fn decode_stream(resp: reqwest::Response) -> ChunkStream {
    decode_sse(resp.bytes_stream())
}

fn decode_sse<S, B, E>(byte_stream: S) -> ChunkStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<ChatCompletionChunk, AdapterError>>(64);
    tokio::spawn(async move {
        let mut stream = Box::pin(byte_stream.eventsource());
        let mut sent_terminal = false;
        let mut last_id = String::new();
        let mut last_created = crate::api::now_unix();
        let mut last_model = String::new();
        let mut finish_reason: Option<String> = None;
        while let Some(ev) = stream.next().await {
            let ev = match ev {
                Ok(ev) => ev,
                Err(err) => {
                    let _ = tx.send(Err(AdapterError::transient(err.to_string()))).await;
                    return;
                }
            };
            let data = ev.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx
                        .send(Err(AdapterError::transform(format!(
                            "bad stream frame: {}",
                            err
                        ))))
                        .await;
                    return;
                }
            };
            last_id = chunk.id.clone();
            last_created = chunk.created;
            last_model = chunk.model.clone();
            if let Some(reason) = chunk.choices.iter().find_map(|c| c.finish_reason.clone()) {
                finish_reason = Some(reason);
            }
            let terminal = chunk.is_terminal();
            if tx.send(Ok(chunk)).await.is_err() {
                // receiver hung up, drop the upstream connection
                return;
            }
            if terminal {
                sent_terminal = true;
                break;
            }
        }
        if !sent_terminal {
            let chunk = ChatCompletionChunk::terminal(
                &last_id,
                last_created,
                &last_model,
                finish_reason.as_deref().unwrap_or("stop"),
                Usage::default(),
            );
            let _ = tx.send(Ok(chunk)).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

pub(crate) fn extract_error(value: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let error = value.get("error");
    let field = |key: &str| {
        error
            .and_then(|e| e.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    (field("message"), field("type"), field("code"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatMessage, Role};

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
            ],
            stream: stream.then_some(true),
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(128),
            stop: None,
            user: None,
        }
    }

    #[test]
    fn encode_maps_model_and_skips_absent_options() {
        let body = encode_request(&request(false), "gpt-4o-2024-08-06");
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 128);
        assert!(body.get("top_p").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn encode_stream_requests_usage_frames() {
        let body = encode_request(&request(true), "gpt-4o-2024-08-06");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn decode_full_response() {
        let value = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        let resp = decode_response(&value).unwrap();
        assert_eq!(resp.choices[0].message.content, "hello");
        assert_eq!(resp.usage.total_tokens, 12);
        assert_eq!(resp.usage.cost_total, 0.0);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = decode_response(&json!({"id": "x"})).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.code, "upstream_transform_failed");
    }

    async fn replay(frames: &[&str]) -> Vec<ChatCompletionChunk> {
        let bytes = bytes::Bytes::from(frames.concat());
        let mut stream = decode_sse(futures_util::stream::iter([Ok::<
            _,
            std::convert::Infallible,
        >(bytes)]));
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item.unwrap());
        }
        chunks
    }

    #[tokio::test]
    async fn stream_frames_pass_through_with_one_terminal() {
        let frames = [
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-test\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-test\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-test\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3,\"total_tokens\":12}}\n\n",
            "data: [DONE]\n\n",
        ];
        let chunks = replay(&frames).await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hi"));
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
        let terminal = chunks.last().unwrap();
        assert_eq!(terminal.usage.as_ref().unwrap().total_tokens, 12);
    }

    #[tokio::test]
    async fn stream_without_usage_frame_still_terminates() {
        let frames = [
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-test\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ];
        let chunks = replay(&frames).await;
        assert_eq!(chunks.len(), 2);
        let terminal = chunks.last().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(terminal.usage.as_ref().unwrap().total_tokens, 0);
    }
}
