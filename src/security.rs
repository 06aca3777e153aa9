use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "X-Publisher-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub operator: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    operator: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("PUBLISHER_API_KEYS").unwrap_or_else(|_| "operator:dev-key".to_string());
        Self::from_list(&raw)
    }

    /// Parse `operator:key` pairs separated by commas.
    pub fn from_list(raw: &str) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            operator: record.operator.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Publisher-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "publisher.api", "rejected unknown API key");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let operator = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (operator, key) {
            (Some(operator), Some(secret)) => {
                let record = KeyRecord {
                    operator: operator.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "publisher.api",
                "ignored malformed PUBLISHER_API_KEYS entry"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "publisher.api",
            "PUBLISHER_API_KEYS produced no keys; operator endpoints will reject every call"
        );
    } else {
        info!(
            target = "publisher.api",
            key_count = entries.len(),
            "loaded API keys"
        );
    }
    entries
}
