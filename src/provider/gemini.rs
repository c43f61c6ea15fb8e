//! Gemini generateContent dialect. Messages become `contents` with user/model
//! roles, system turns become `systemInstruction`, tuning knobs move under
//! `generationConfig`, and `usageMetadata` maps back to canonical usage. The
//! SSE stream has no done sentinel; it simply ends after the frame that
//! carries the final usage metadata.

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

pub struct GeminiAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl GeminiAdapter {
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
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: &ChatCompletionRequest,
        upstream_model: &str,
    ) -> Result<AdapterReply, AdapterError> {
        let body = encode_request(request, upstream_model);
        let auth = UpstreamAuth::Header {
            name: "x-goog-api-key",
            value: &self.api_key,
        };
        if request.wants_stream() {
            let path = format!(
                "/v1beta/models/{}:streamGenerateContent?alt=sse",
                upstream_model
            );
            let resp = upstream::post_raw(
                &self.client,
                &self.base_url,
                &path,
                auth,
                &body,
                self.timeout_ms,
                &[],
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Stream(decode_stream(resp, upstream_model)))
        } else {
            let path = format!("/v1beta/models/{}:generateContent", upstream_model);
            let value = upstream::post_json(
                &self.client,
                &self.base_url,
                &path,
                auth,
                &body,
                self.timeout_ms,
                &[],
            )
            .await
            .map_err(|err| classify_upstream_error(err, extract_error))?;
            Ok(AdapterReply::Full(decode_response(&value, upstream_model)?))
        }
    }
}

pub(crate) fn encode_request(request: &ChatCompletionRequest, _upstream_model: &str) -> Value {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System | Role::Developer => {
                system_parts.push(json!({"text": message.content}));
            }
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": [{"text": message.content}],
            })),
            Role::User => contents.push(json!({
                "role": "user",
                "parts": [{"text": message.content}],
            })),
            // no slot for bare tool results in this projection
            Role::Tool => {}
        }
    }
    let mut body = json!({"contents": contents});
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": system_parts});
    }
    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(stop) = &request.stop {
        generation_config.insert("stopSequences".to_string(), json!(stop));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    body
}

pub(crate) fn decode_response(
    value: &Value,
    upstream_model: &str,
) -> Result<ChatCompletionResponse, AdapterError> {
    let candidate = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| AdapterError::transform("response missing candidates"))?;
    let text = candidate_text(candidate);
    let finish_reason = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(map_finish_reason);
    Ok(ChatCompletionResponse {
        id: format!("gen-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: crate::api::now_unix(),
        model: upstream_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new(Role::Assistant, text),
            finish_reason,
        }],
        usage: decode_usage(value.get("usageMetadata")),
    })
}

fn candidate_text(candidate: &Value) -> String {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn decode_usage(value: Option<&Value>) -> Usage {
    let prompt = value
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion = value
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Usage::from_tokens(prompt, completion)
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "PROHIBITED_CONTENT" => "content_filter".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

pub(crate) fn decode_stream(resp: reqwest::Response, upstream_model: &str) -> ChunkStream {
    decode_sse(resp.bytes_stream(), upstream_model)
}

fn decode_sse<S, B, E>(byte_stream: S, upstream_model: &str) -> ChunkStream
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let model = upstream_model.to_string();
    let (tx, rx) = mpsc::channel::<Result<ChatCompletionChunk, AdapterError>>(64);
    tokio::spawn(async move {
        let mut stream = Box::pin(byte_stream.eventsource());
        let id = format!("gen-{}", uuid::Uuid::new_v4());
        let created = crate::api::now_unix();
        let mut usage = Usage::default();
        let mut finish_reason = "stop".to_string();
        let mut first = true;
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
            if let Some(metadata) = value.get("usageMetadata") {
                usage = decode_usage(Some(metadata));
            }
            let Some(candidate) = value
                .get("candidates")
                .and_then(|v| v.as_array())
                .and_then(|candidates| candidates.first())
            else {
                continue;
            };
            if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
                finish_reason = map_finish_reason(reason);
            }
            let text = candidate_text(candidate);
            if text.is_empty() && !first {
                continue;
            }
            let chunk = ChatCompletionChunk::delta(
                &id,
                created,
                &model,
                ChunkDelta {
                    role: first.then_some(Role::Assistant),
                    content: Some(text),
                },
            );
            first = false;
            if tx.send(Ok(chunk)).await.is_err() {
                return;
            }
        }
        let chunk = ChatCompletionChunk::terminal(&id, created, &model, &finish_reason, usage);
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
    let status = error
        .and_then(|e| e.get("status"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase());
    (message, None, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
                ChatMessage::new(Role::Assistant, "hello"),
                ChatMessage::new(Role::User, "bye"),
            ],
            stream: None,
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(256),
            stop: None,
            user: None,
        }
    }

    #[test]
    fn encode_builds_contents_and_generation_config() {
        let body = encode_request(&request(), "gemini-2.0-flash");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
        assert_eq!(body["generationConfig"]["topP"], 0.9);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn encode_drops_tool_turns() {
        let mut req = request();
        req.messages
            .insert(3, ChatMessage::new(Role::Tool, "{\"result\":42}"));
        let body = encode_request(&req, "gemini-2.0-flash");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert!(
            contents
                .iter()
                .all(|c| c["parts"][0]["text"] != "{\"result\":42}")
        );
    }

    #[test]
    fn encode_omits_empty_generation_config() {
        let mut req = request();
        req.temperature = None;
        req.top_p = None;
        req.max_tokens = None;
        let body = encode_request(&req, "gemini-2.0-flash");
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn decode_maps_candidates_and_usage_metadata() {
        let value = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "bonjour"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 8,
                "candidatesTokenCount": 2,
                "totalTokenCount": 10
            }
        });
        let resp = decode_response(&value, "gemini-2.0-flash").unwrap();
        assert_eq!(resp.choices[0].message.content, "bonjour");
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.prompt_tokens, 8);
        assert_eq!(resp.usage.total_tokens, 10);
        assert_eq!(resp.model, "gemini-2.0-flash");
    }

    #[test]
    fn decode_without_candidates_is_transform_error() {
        let err = decode_response(&json!({}), "gemini-2.0-flash").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stream_frames_become_deltas_with_trailing_terminal() {
        use futures_util::StreamExt;

        let frames = [
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"bon\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"jour\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":8,\"candidatesTokenCount\":2}}\n\n",
        ];
        let bytes = bytes::Bytes::from(frames.concat());
        let mut stream = decode_sse(
            futures_util::stream::iter([Ok::<_, std::convert::Infallible>(bytes)]),
            "gemini-2.0-flash",
        );
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            chunks.push(item.unwrap());
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("bon"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("jour"));
        let terminal = chunks.last().unwrap();
        assert!(terminal.is_terminal());
        assert_eq!(terminal.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(terminal.usage.as_ref().unwrap().prompt_tokens, 8);
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    }

    #[test]
    fn safety_maps_to_content_filter() {
        assert_eq!(map_finish_reason("SAFETY"), "content_filter");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("RECITATION"), "recitation");
    }
}
