use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{ChatCompletionRequest, Usage};
use crate::app::AppState;
use crate::auth::AuthResult;
use crate::error::AppError;
use crate::policy::{AuthorizationRequest, Decision};
use crate::provider::{AdapterError, AdapterReply, ChunkStream};
use crate::router::RouterError;
use crate::usage::{ResponseStatus, UsageRecord};

const API_TYPE_CHAT: &str = "chat.completions";

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let started = std::time::Instant::now();
    let request_id = format!("req-{}", uuid::Uuid::new_v4());
    let trace_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| request_id.clone());

    let auth = match authenticate(&state, &headers) {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    let request: ChatCompletionRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            return AppError::invalid_request(format!("invalid chat completion request: {}", err))
                .into_response();
        }
    };

    let ctx = RequestContext {
        state: state.clone(),
        started,
        request_id,
        trace_id,
        api_key_name: auth.key_name.clone(),
        incoming_model: request.model.clone(),
    };

    if !auth.model_allowed(&request.model) {
        let err = AppError::new(
            StatusCode::FORBIDDEN,
            "model_not_allowed",
            format!("api key is not allowed to use model {}", request.model),
        )
        .with_type("permission_error");
        ctx.record("", "", ResponseStatus::Error, Usage::default());
        return err.into_response();
    }

    if !state.policy.is_empty() {
        let decision = state.policy.authorize(&authorization_request(&auth, &request));
        if decision.decision == Decision::Deny {
            tracing::info!(
                request_id = %ctx.request_id,
                principal = %auth.key_name,
                model = %request.model,
                reasons = ?decision.reasons,
                "request denied by policy"
            );
            ctx.record("", "", ResponseStatus::Error, Usage::default());
            return AppError::policy_denied(&decision.reasons).into_response();
        }
    }

    let dispatched = match state.router.dispatch(&request).await {
        Ok(dispatched) => dispatched,
        Err(err) => {
            ctx.record("", "", ResponseStatus::Error, Usage::default());
            return router_error_to_app(&err).into_response();
        }
    };

    match dispatched.reply {
        AdapterReply::Full(mut resp) => {
            resp.usage.cost_total = state.pricing.calculate(
                &dispatched.provider,
                &dispatched.upstream_model,
                resp.usage.prompt_tokens,
                resp.usage.completion_tokens,
            );
            resp.model = request.model.clone();
            ctx.record(
                &dispatched.provider,
                &dispatched.upstream_model,
                ResponseStatus::Success,
                resp.usage.clone(),
            );
            Json(resp).into_response()
        }
        AdapterReply::Stream(stream) => {
            let (tx, rx) = mpsc::channel::<Event>(64);
            tokio::spawn(forward_stream(
                stream,
                tx,
                ctx,
                dispatched.provider,
                dispatched.upstream_model,
                request.model.clone(),
            ));
            Sse::new(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>))
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

async fn forward_stream(
    mut stream: ChunkStream,
    tx: mpsc::Sender<Event>,
    ctx: RequestContext,
    provider: String,
    upstream_model: String,
    logical_model: String,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(mut chunk) => {
                chunk.model = logical_model.clone();
                if let Some(usage) = chunk.usage.as_mut() {
                    usage.cost_total = ctx.state.pricing.calculate(
                        &provider,
                        &upstream_model,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                    );
                }
                let terminal = chunk.is_terminal();
                let payload = match serde_json::to_string(&chunk) {
                    Ok(payload) => payload,
                    Err(err) => {
                        let app = AppError::internal(format!("serialize chunk: {}", err));
                        let _ = tx.send(Event::default().data(app.to_envelope().to_string())).await;
                        ctx.record(&provider, &upstream_model, ResponseStatus::Error, Usage::default());
                        return;
                    }
                };
                if tx.send(Event::default().data(payload)).await.is_err() {
                    // client went away mid-stream; no terminal frame
                    ctx.record(
                        &provider,
                        &upstream_model,
                        ResponseStatus::Canceled,
                        chunk.usage.clone().unwrap_or_default(),
                    );
                    return;
                }
                if terminal {
                    let usage = chunk.usage.clone().unwrap_or_default();
                    if tx.send(Event::default().data("[DONE]")).await.is_err() {
                        ctx.record(&provider, &upstream_model, ResponseStatus::Canceled, usage);
                        return;
                    }
                    ctx.record(&provider, &upstream_model, ResponseStatus::Success, usage);
                    return;
                }
            }
            Err(err) => {
                let app = adapter_error_to_app(&err);
                let _ = tx.send(Event::default().data(app.to_envelope().to_string())).await;
                ctx.record(&provider, &upstream_model, ResponseStatus::Error, Usage::default());
                return;
            }
        }
    }
    ctx.record(&provider, &upstream_model, ResponseStatus::Error, Usage::default());
}

struct RequestContext {
    state: AppState,
    started: std::time::Instant,
    request_id: String,
    trace_id: String,
    api_key_name: String,
    incoming_model: String,
}

impl RequestContext {
    fn record(&self, provider: &str, selected_model: &str, status: ResponseStatus, usage: Usage) {
        self.state.usage.add(UsageRecord {
            timestamp: chrono::Utc::now(),
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            api_key_name: self.api_key_name.clone(),
            api_type: API_TYPE_CHAT.to_string(),
            incoming_model: self.incoming_model.clone(),
            selected_model: selected_model.to_string(),
            provider: provider.to_string(),
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            usage,
        });
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthResult, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::unauthorized("missing_api_key", "missing bearer api key"))?;
    state
        .api_keys
        .authenticate(token)
        .ok_or_else(|| AppError::unauthorized("invalid_api_key", "invalid or disabled api key"))
}

fn authorization_request(auth: &AuthResult, request: &ChatCompletionRequest) -> AuthorizationRequest {
    let mut context = std::collections::HashMap::new();
    if let Some(workspace) = &auth.workspace {
        context.insert("workspace".to_string(), workspace.clone());
    }
    AuthorizationRequest {
        principal: auth.key_name.clone(),
        action: API_TYPE_CHAT.to_string(),
        resource: request.model.clone(),
        context,
    }
}

fn router_error_to_app(err: &RouterError) -> AppError {
    match err {
        RouterError::ModelNotFound(model) => AppError::model_not_found(model),
        RouterError::Upstream(err) => adapter_error_to_app(err),
        RouterError::AllCandidatesFailed { attempts, last } => AppError::new(
            StatusCode::BAD_GATEWAY,
            "all_candidates_failed",
            format!("all {} route candidates failed: {}", attempts, last.message),
        )
        .with_type("api_error"),
    }
}

fn adapter_error_to_app(err: &AdapterError) -> AppError {
    AppError::new(err.http_status(), err.code.clone(), err.message.clone())
        .with_type(err.error_type.clone())
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .router
        .routes()
        .models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "owned_by": "modelgate",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub limit: usize,
}

pub async fn list_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Json<Value> {
    Json(json!({"object": "list", "data": state.usage.list(query.limit)}))
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_errors_map_to_canonical_statuses() {
        let not_found = router_error_to_app(&RouterError::ModelNotFound("x".to_string()));
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let exhausted = router_error_to_app(&RouterError::AllCandidatesFailed {
            attempts: 2,
            last: AdapterError::transient("boom"),
        });
        assert_eq!(exhausted.status, StatusCode::BAD_GATEWAY);
        assert_eq!(exhausted.code, "all_candidates_failed");

        let rejected = router_error_to_app(&RouterError::Upstream(AdapterError::rejected(
            StatusCode::UNPROCESSABLE_ENTITY,
            "bad",
            "invalid_request_error",
            "bad_prompt",
        )));
        assert_eq!(rejected.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(rejected.code, "bad_prompt");
    }
}
