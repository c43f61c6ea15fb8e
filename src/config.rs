use std::collections::HashMap;

use serde::Deserialize;

use crate::policy::PolicyRule;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_usage_capacity")]
    pub usage_capacity: usize,
    pub providers: Vec<ProviderConfig>,
    pub routes: HashMap<String, Vec<CandidateConfig>>,
    #[serde(default)]
    pub pricing: Vec<PricingConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Openai,
    Anthropic,
    Gemini,
    Generic,
}

impl ProviderConfig {
    /// Effective base URL: the configured override, or the provider family's
    /// public endpoint. Generic providers have no default and must set one.
    pub fn effective_base_url(&self) -> Option<String> {
        if let Some(base) = &self.base_url {
            return Some(base.clone());
        }
        match self.provider_type {
            ProviderType::Openai => Some("https://api.openai.com".to_string()),
            ProviderType::Anthropic => Some("https://api.anthropic.com".to_string()),
            ProviderType::Gemini => Some("https://generativelanguage.googleapis.com".to_string()),
            ProviderType::Generic => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateConfig {
    pub provider: String,
    pub upstream_model: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    pub provider: String,
    pub model: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub workspace: Option<String>,
    /// Empty means every routed model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl GatewayConfig {
    pub fn load() -> Result<Self, String> {
        let path =
            std::env::var("MODELGATE_CONFIG").unwrap_or_else(|_| "modelgate.json".to_string());
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| format!("read config {}: {}", path, err))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        let mut config: GatewayConfig =
            serde_json::from_str(raw).map_err(|err| format!("parse config: {}", err))?;
        if let Ok(listen) = std::env::var("MODELGATE_LISTEN") {
            config.listen = listen;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        let mut provider_ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(format!("duplicate provider id: {}", provider.id));
            }
            if provider.effective_base_url().is_none() {
                return Err(format!(
                    "provider {} requires base_url for type generic",
                    provider.id
                ));
            }
        }
        for (model, candidates) in &self.routes {
            if candidates.is_empty() {
                return Err(format!("route {} has no candidates", model));
            }
            for candidate in candidates {
                if !provider_ids.contains(candidate.provider.as_str()) {
                    return Err(format!(
                        "route {} references unknown provider {}",
                        model, candidate.provider
                    ));
                }
            }
        }
        let mut rule_ids = std::collections::HashSet::new();
        for rule in &self.policies {
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(format!("duplicate policy rule id: {}", rule.id));
            }
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_usage_capacity() -> usize {
    1000
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "providers": [
                {"id": "oai", "type": "openai", "api_key": "sk-upstream"}
            ],
            "routes": {
                "gpt-4o": [{"provider": "oai", "upstream_model": "gpt-4o-2024-08-06"}]
            }
        })
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = GatewayConfig::from_json(&minimal().to_string()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.usage_capacity, 1000);
        assert_eq!(config.routes["gpt-4o"][0].weight, 1);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut raw = minimal();
        raw["providres"] = serde_json::json!([]);
        assert!(GatewayConfig::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn route_to_unknown_provider_fails_validation() {
        let mut raw = minimal();
        raw["routes"]["gpt-4o"][0]["provider"] = serde_json::json!("missing");
        let err = GatewayConfig::from_json(&raw.to_string()).unwrap_err();
        assert!(err.contains("unknown provider"));
    }

    #[test]
    fn generic_provider_requires_base_url() {
        let mut raw = minimal();
        raw["providers"][0]["type"] = serde_json::json!("generic");
        let err = GatewayConfig::from_json(&raw.to_string()).unwrap_err();
        assert!(err.contains("base_url"));
    }
}
