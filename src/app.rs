use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth::ApiKeyRegistry;
use crate::config::GatewayConfig;
use crate::cost::PricingTable;
use crate::error::{AppError, AppResult};
use crate::policy::PolicyEngine;
use crate::provider::AdapterRegistry;
use crate::router::{RouteTable, Router};
use crate::usage::UsageRecorder;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub api_keys: Arc<ApiKeyRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub pricing: Arc<PricingTable>,
    pub router: Arc<Router>,
    pub usage: Arc<UsageRecorder>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
}

pub fn load_state() -> AppResult<AppState> {
    let config = GatewayConfig::load()
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "config_invalid", err))?;
    state_from_config(config)
}

pub fn state_from_config(config: GatewayConfig) -> AppResult<AppState> {
    let client = reqwest::Client::new();
    let registry =
        AdapterRegistry::from_config(&client, &config.providers, config.request_timeout_ms)
            .map_err(|err| {
                AppError::new(StatusCode::BAD_REQUEST, "config_invalid", err.to_string())
            })?;
    let routes = RouteTable::from_config(&config.routes);
    if config.policies.is_empty() {
        tracing::warn!("no policies configured, authorization checks are disabled");
    }
    Ok(AppState {
        runtime: Arc::new(RuntimeConfig {
            listen: config.listen.clone(),
        }),
        api_keys: Arc::new(ApiKeyRegistry::new(config.api_keys)),
        policy: Arc::new(PolicyEngine::new(config.policies)),
        pricing: Arc::new(PricingTable::new(&config.pricing)),
        router: Arc::new(Router::new(registry, routes)),
        usage: Arc::new(UsageRecorder::new(config.usage_capacity)),
    })
}

pub fn build_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(crate::handlers::healthz))
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/v1/usage", get(crate::handlers::list_usage))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
