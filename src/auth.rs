use std::collections::HashMap;

use crate::config::ApiKeyConfig;

/// Result of authenticating a presented bearer key.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub key_name: String,
    pub workspace: Option<String>,
    allowed_models: Vec<String>,
}

impl AuthResult {
    /// An empty allow-list means every routed model is permitted.
    pub fn model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Clone, Debug)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, ApiKeyConfig>,
}

impl ApiKeyRegistry {
    pub fn new(entries: Vec<ApiKeyConfig>) -> Self {
        let keys = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self { keys }
    }

    pub fn authenticate(&self, token: &str) -> Option<AuthResult> {
        let entry = self.keys.get(token)?;
        if !entry.enabled {
            return None;
        }
        Some(AuthResult {
            key_name: entry.name.clone(),
            workspace: entry.workspace.clone(),
            allowed_models: entry.allowed_models.clone(),
        })
    }
}
