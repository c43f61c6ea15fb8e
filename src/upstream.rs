//! Thin reqwest helpers shared by the provider adapters. Adapters own the
//! dialect; this module owns transport: URL joining, auth placement, timeout,
//! and the split between network failures and non-2xx responses.

use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    /// Raw error body text for non-2xx responses, for dialect-aware
    /// normalization by the adapter.
    pub body: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            body: None,
            message,
        }
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum UpstreamAuth<'a> {
    Bearer(&'a str),
    Header { name: &'a str, value: &'a str },
}

pub async fn post_json(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    auth: UpstreamAuth<'_>,
    body: &Value,
    timeout_ms: u64,
    extra_headers: &[(&str, &str)],
) -> Result<Value, UpstreamCallError> {
    let resp = post_raw(client, base_url, path, auth, body, timeout_ms, extra_headers).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), err.to_string())
    })?;
    Ok(value)
}

pub async fn post_raw(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    auth: UpstreamAuth<'_>,
    body: &Value,
    timeout_ms: u64,
    extra_headers: &[(&str, &str)],
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(base_url, path);
    let mut req = client
        .post(url)
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .json(body);
    req = apply_auth(req, auth);
    for (k, v) in extra_headers {
        req = req.header(*k, *v);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}", status),
        )
        .with_body(text));
    }
    Ok(resp)
}

fn apply_auth(req: reqwest::RequestBuilder, auth: UpstreamAuth<'_>) -> reqwest::RequestBuilder {
    match auth {
        UpstreamAuth::Bearer(value) => req.bearer_auth(value),
        UpstreamAuth::Header { name, value } => req.header(name, value),
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}
