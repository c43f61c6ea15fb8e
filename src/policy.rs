//! Policy decision point: an ordered, closed set of permit/forbid rules
//! evaluated over (principal, action, resource, context). Any matching forbid
//! wins over any number of permits, and no matching permit means deny.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Permit,
    Forbid,
}

/// A single rule. `None` selectors match anything; context entries must all
/// be present and equal in the request context.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub id: String,
    pub effect: Effect,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub principal: String,
    pub action: String,
    pub resource: String,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationDecision {
    pub decision: Decision,
    /// Ids of every rule that matched, in declaration order.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// True when no rules are configured. Callers that treat an absent rule
    /// set as "authorization disabled" check this before asking for a
    /// decision; `authorize` itself always denies on an empty set.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
        let mut reasons = Vec::new();
        let mut permitted = false;
        let mut forbidden = false;
        for rule in &self.rules {
            if !rule_matches(rule, request) {
                continue;
            }
            reasons.push(rule.id.clone());
            match rule.effect {
                Effect::Permit => permitted = true,
                Effect::Forbid => forbidden = true,
            }
        }
        let decision = if forbidden || !permitted {
            Decision::Deny
        } else {
            Decision::Allow
        };
        AuthorizationDecision { decision, reasons }
    }
}

fn rule_matches(rule: &PolicyRule, request: &AuthorizationRequest) -> bool {
    if let Some(principal) = &rule.principal {
        if principal != &request.principal {
            return false;
        }
    }
    if let Some(action) = &rule.action {
        if action != &request.action {
            return false;
        }
    }
    if let Some(resource) = &rule.resource {
        if resource != &request.resource {
            return false;
        }
    }
    rule.context
        .iter()
        .all(|(key, want)| request.context.get(key) == Some(want))
}
