//! Anthropic messages dialect. System and developer turns hoist into the
//! top-level `system` field, stop reasons map to OpenAI finish reasons, and
//! the event stream (message_start, content_block_delta, message_delta,
//! message_stop) collapses into canonical chunks with a single terminal frame.

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use async_trait::async_trait;
use eventsource_stream::Eventsource;

use crate::api::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkDelta, Role, Usage,
};
use crate::provider::{
    AdapterError, AdapterReply, ChunkStream, ProviderAdapter, classify_upstream_error,
};
use crate::upstream::{self, UpstreamAuth};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl AnthropicAdapter {
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
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
    ) -> Result<AdapterReply, AdapterError> {
        let body = encode_request(request, upstream_model);
        let headers = [("anthropic-version", ANTHROPIC_VERSION)];
        let auth = UpstreamAuth::Header {
            name: "x-api-key",
            value: &self.api_key,
        };
        if request.wants_stream() {
            let resp = upstream::post_raw(
                &self.client,
                &self.base_url,
                "/v1/messages",
                auth,
                &body,
                self.timeout_ms,
                &headers,
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Stream(decode_stream(resp)))
        } else {
            let value = upstream::post_json(
                &self.client,
                &self.base_url,
                "/v1/messages",
                auth,
                &body,
                self.timeout_ms,
                &headers,
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Full(decode_response(&value)?))
        }
    }
}

pub(crate) fn encode_request(request: &ChatCompletionRequest, upstream_model: &str) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System | Role::Developer => system_parts.push(&message.content),
            Role::Assistant => messages.push(json!({
                "role": "assistant",
                "content": message.content,
            })),
            // no slot for bare tool results in this projection
            Role::Tool => {}
            Role::User => messages.push(json!({
                "role": "user",
                "content": message.content,
            })),
        }
    }
    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    if request.wants_stream() {
        body["stream"] = json!(true);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(stop) = &request.stop {
        body["stop_sequences"] = json!(stop);
    }
    body
}

pub(crate) fn decode_response(value: &Value) -> Result<ChatCompletionResponse, AdapterError> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AdapterError::transform("message missing id"))?;
    let model = value
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let text = value
        .get("content")
        .and_then(|v| v.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| AdapterError::transform("message missing content"))?;
    let stop_reason = value.get("stop_reason").and_then(|v| v.as_str());
    let usage = decode_usage(value.get("usage"));
    Ok(ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: crate::api::now_unix(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new(Role::Assistant, text),
            finish_reason: stop_reason.map(map_stop_reason),
        }],
        usage,
    })
}

fn decode_usage(value: Option<&Value>) -> Usage {
    let input = value
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = value
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Usage::from_tokens(input, output)
}

fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
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
        let created = crate::api::now_unix();
        let mut id = String::new();
        let mut model = String::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut finish_reason = "stop".to_string();
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
            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
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
            let event_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or(ev.event.as_str());
            match event_type {
                "message_start" => {
                    let message = value.get("message").cloned().unwrap_or_default();
                    id = message
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    input_tokens = message
                        .get("usage")
                        .and_then(|u| u.get("input_tokens"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let chunk = ChatCompletionChunk::delta(
                        &id,
                        created,
                        &model,
                        ChunkDelta {
                            role: Some(Role::Assistant),
                            content: None,
                        },
                    );
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                "content_block_delta" => {
                    let text = value
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str());
                    if let Some(text) = text {
                        let chunk = ChatCompletionChunk::delta(
                            &id,
                            created,
                            &model,
                            ChunkDelta {
                                role: None,
                                content: Some(text.to_string()),
                            },
                        );
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(reason) = value
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|v| v.as_str())
                    {
                        finish_reason = map_stop_reason(reason);
                    }
                    if let Some(tokens) = value
                        .get("usage")
                        .and_then(|u| u.get("output_tokens"))
                        .and_then(|v| v.as_u64())
                    {
                        output_tokens = tokens;
                    }
                }
                "message_stop" => {
                    let chunk = ChatCompletionChunk::terminal(
                        &id,
                        created,
                        &model,
                        &finish_reason,
                        Usage::from_tokens(input_tokens, output_tokens),
                    );
                    let _ = tx.send(Ok(chunk)).await;
                    return;
                }
                "error" => {
                    let (message, error_type, _) = extract_error(&value);
                    let err = match error_type.as_deref() {
                        Some("overloaded_error") => AdapterError::transient(
                            message.unwrap_or_else(|| "upstream overloaded".to_string()),
                        ),
                        _ => AdapterError::transform(
                            message.unwrap_or_else(|| "upstream stream error".to_string()),
                        ),
                    };
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                // ping, content_block_start, content_block_stop
                _ => {}
            }
        }
        // stream ended without message_stop
        let chunk = ChatCompletionChunk::terminal(
            &id,
            created,
            &model,
            &finish_reason,
            Usage::from_tokens(input_tokens, output_tokens),
        );
        let _ = tx.send(Ok(chunk)).await;
    });
    Box::pin(ReceiverStream::new(rx))
}

pub(crate) fn extract_error(value: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let error = value.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let error_type = error
        .and_then(|e| e.get("type"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    (message, error_type.clone(), error_type)
}
