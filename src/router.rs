//! Model router: resolves a client-facing model name to its route candidates,
//! picks the first attempt by weighted random, then fails over through the
//! remaining candidates in declared order. Transient upstream failures move
//! to the next candidate; definitive rejections stop the walk.

use std::collections::HashMap;

use thiserror::Error;

use crate::api::ChatCompletionRequest;
use crate::config::CandidateConfig;
use crate::provider::{AdapterError, AdapterRegistry, AdapterReply};

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: String,
    pub upstream_model: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<Candidate>>,
}

impl RouteTable {
    pub fn from_config(routes: &HashMap<String, Vec<CandidateConfig>>) -> Self {
        let routes = routes
            .iter()
            .map(|(model, candidates)| {
                let candidates = candidates
                    .iter()
                    .map(|c| Candidate {
                        provider: c.provider.clone(),
                        upstream_model: c.upstream_model.clone(),
                        weight: c.weight,
                    })
                    .collect();
                (model.clone(), candidates)
            })
            .collect();
        Self { routes }
    }

    pub fn get(&self, model: &str) -> Option<&[Candidate]> {
        self.routes.get(model).map(|c| c.as_slice())
    }

    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.routes.keys().cloned().collect();
        models.sort();
        models
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    /// A candidate rejected the request definitively; no failover.
    #[error("{0}")]
    Upstream(AdapterError),
    #[error("all {attempts} candidates failed: {last}")]
    AllCandidatesFailed { attempts: usize, last: AdapterError },
}

pub struct Dispatched {
    pub provider: String,
    pub upstream_model: String,
    pub reply: AdapterReply,
}

pub struct Router {
    registry: AdapterRegistry,
    routes: RouteTable,
}

impl Router {
    pub fn new(registry: AdapterRegistry, routes: RouteTable) -> Self {
        Self { registry, routes }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn dispatch(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<Dispatched, RouterError> {
        let candidates = self
            .routes
            .get(&request.model)
            .ok_or_else(|| RouterError::ModelNotFound(request.model.clone()))?;
        let ordered = order_candidates(candidates);
        let mut attempts = 0usize;
        let mut last_err: Option<AdapterError> = None;
        for candidate in ordered {
            let Some(adapter) = self.registry.get(&candidate.provider) else {
                tracing::warn!(provider = %candidate.provider, "route references missing adapter");
                last_err = Some(AdapterError::transient(format!(
                    "adapter {} not registered",
                    candidate.provider
                )));
                continue;
            };
            attempts += 1;
            match adapter.execute(request, &candidate.upstream_model).await {
                Ok(reply) => {
                    return Ok(Dispatched {
                        provider: candidate.provider.clone(),
                        upstream_model: candidate.upstream_model.clone(),
                        reply,
                    });
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        provider = %candidate.provider,
                        upstream_model = %candidate.upstream_model,
                        error = %err,
                        "candidate failed, trying next"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(RouterError::Upstream(err)),
            }
        }
        let last = last_err
            .unwrap_or_else(|| AdapterError::transient("no route candidates were attempted"));
        Err(RouterError::AllCandidatesFailed { attempts, last })
    }
}

/// First slot goes to a weighted random pick over positive-weight candidates;
/// the rest keep their declared order. Zero-weight candidates never win the
/// first slot but stay in the failover chain.
pub(crate) fn order_candidates(candidates: &[Candidate]) -> Vec<&Candidate> {
    let total_weight: u64 = candidates.iter().map(|c| c.weight as u64).sum();
    if total_weight == 0 || candidates.len() < 2 {
        return candidates.iter().collect();
    }
    let target = random_u64(total_weight);
    let mut cumulative = 0u64;
    let mut chosen = 0usize;
    for (idx, candidate) in candidates.iter().enumerate() {
        cumulative += candidate.weight as u64;
        if target < cumulative {
            chosen = idx;
            break;
        }
    }
    let mut ordered = Vec::with_capacity(candidates.len());
    ordered.push(&candidates[chosen]);
    ordered.extend(
        candidates
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != chosen)
            .map(|(_, c)| c),
    );
    ordered
}

fn random_u64(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    seed % bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::StatusCode;

    use crate::api::{ChatCompletionResponse, ChatMessage, Role, Usage};
    use crate::provider::{AdapterReply, ProviderAdapter};

    fn candidate(provider: &str, weight: u32) -> Candidate {
        Candidate {
            provider: provider.to_string(),
            upstream_model: format!("{}-model", provider),
            weight,
        }
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            user: None,
        }
    }

    fn response(model: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-test".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: model.to_string(),
            choices: vec![],
            usage: Usage::from_tokens(1, 1),
        }
    }

    enum Script {
        Ok,
        Transient,
        Rejected,
    }

    struct ScriptedAdapter {
        name: String,
        script: Script,
        calls: Arc<Mutex<u32>>,
    }

    impl ScriptedAdapter {
        fn new(name: &str, script: Script) -> (Arc<Self>, Arc<Mutex<u32>>) {
            let calls = Arc::new(Mutex::new(0));
            let adapter = Arc::new(Self {
                name: name.to_string(),
                script,
                calls: calls.clone(),
            });
            (adapter, calls)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(
            &self,
            _request: &ChatCompletionRequest,
            upstream_model: &str,
        ) -> Result<AdapterReply, crate::provider::AdapterError> {
            *self.calls.lock().unwrap() += 1;
            match self.script {
                Script::Ok => Ok(AdapterReply::Full(response(upstream_model))),
                Script::Transient => Err(crate::provider::AdapterError::transient("boom")),
                Script::Rejected => Err(crate::provider::AdapterError::rejected(
                    StatusCode::BAD_REQUEST,
                    "bad prompt",
                    "invalid_request_error",
                    "bad_prompt",
                )),
            }
        }
    }

    fn router(entries: Vec<(&str, Script)>, route: &[(&str, u32)]) -> (Router, Vec<Arc<Mutex<u32>>>) {
        let mut registry = AdapterRegistry::empty();
        let mut counters = Vec::new();
        for (name, script) in entries {
            let (adapter, calls) = ScriptedAdapter::new(name, script);
            registry.insert(name, adapter);
            counters.push(calls);
        }
        let mut routes = HashMap::new();
        routes.insert(
            "demo".to_string(),
            route
                .iter()
                .map(|(provider, weight)| CandidateConfig {
                    provider: provider.to_string(),
                    upstream_model: format!("{}-model", provider),
                    weight: *weight,
                })
                .collect(),
        );
        (
            Router::new(registry, RouteTable::from_config(&routes)),
            counters,
        )
    }

    #[test]
    fn weighted_pick_tracks_weights() {
        let candidates = vec![candidate("a", 9), candidate("b", 1)];
        let mut first_a = 0;
        for _ in 0..2000 {
            let ordered = order_candidates(&candidates);
            if ordered[0].provider == "a" {
                first_a += 1;
            }
        }
        // expected 1800, allow generous slack
        assert!(first_a > 1500, "a won first slot only {} times", first_a);
        assert!(first_a < 2000, "b never won the first slot");
    }

    #[test]
    fn zero_weight_never_wins_first_slot() {
        let candidates = vec![candidate("a", 0), candidate("b", 5)];
        for _ in 0..200 {
            let ordered = order_candidates(&candidates);
            assert_eq!(ordered[0].provider, "b");
            assert_eq!(ordered[1].provider, "a");
        }
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let (router, _) = router(vec![("a", Script::Ok)], &[("a", 1)]);
        let Err(err) = router.dispatch(&request("missing")).await else {
            panic!("expected a routing error");
        };
        assert!(matches!(err, RouterError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn transient_failure_fails_over_in_declared_order() {
        let (router, counters) = router(
            vec![("a", Script::Transient), ("b", Script::Ok)],
            &[("a", 1), ("b", 0)],
        );
        let dispatched = router.dispatch(&request("demo")).await.unwrap();
        assert_eq!(dispatched.provider, "b");
        assert_eq!(*counters[0].lock().unwrap(), 1);
        assert_eq!(*counters[1].lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn rejection_stops_the_walk() {
        let (router, counters) = router(
            vec![("a", Script::Rejected), ("b", Script::Ok)],
            &[("a", 1), ("b", 0)],
        );
        let Err(err) = router.dispatch(&request("demo")).await else {
            panic!("expected a routing error");
        };
        match err {
            RouterError::Upstream(err) => {
                assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(*counters[1].lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_candidates_aggregate() {
        let (router, _) = router(
            vec![("a", Script::Transient), ("b", Script::Transient)],
            &[("a", 1), ("b", 1)],
        );
        let Err(err) = router.dispatch(&request("demo")).await else {
            panic!("expected a routing error");
        };
        match err {
            RouterError::AllCandidatesFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {}", other),
        }
    }
}
