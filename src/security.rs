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

/// Admin keys loaded from `WORKER_ADMIN_KEYS`. An empty set disables the
/// admin routes entirely.
#[derive(Clone, Default)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("WORKER_ADMIN_KEYS").unwrap_or_default();
        let state = Self::parse(&raw);
        if state.keys.is_empty() {
            warn!(
                target = "dropship.api",
                "WORKER_ADMIN_KEYS is empty; admin routes are disabled"
            );
        } else {
            info!(
                target = "dropship.api",
                key_count = state.keys.len(),
                "loaded admin keys from env"
            );
        }
        state
    }

    /// Entries are comma separated, either `name:key` or a bare key.
    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (key_id, secret) = match trimmed.split_once(':') {
                Some((name, secret)) => (name.trim().to_string(), secret.trim()),
                None => (format!("key-{:02}", idx + 1), trimmed),
            };
            if key_id.is_empty() || secret.is_empty() {
                warn!(target = "dropship.api", entry = idx + 1, "ignored malformed WORKER_ADMIN_KEYS entry");
                continue;
            }
            keys.insert(secret.to_string(), AuthContext { key_id });
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_admin_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if !state.is_enabled() {
        return Ok(unauthorized_response(
            "admin_disabled",
            "Set WORKER_ADMIN_KEYS to enable admin routes",
        ));
    }
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Worker-Key or Bearer token",
        ));
    };
    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "dropship.api", path = %request.uri().path(), "admin_key_rejected");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    info!(
        target = "dropship.api",
        key_id = %context.key_id,
        method = %request.method(),
        path = %request.uri().path(),
        "admin_request"
    );
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|value| !value.is_empty());
    }
    headers
        .get("X-Worker-Key")
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

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn parses_named_and_bare_keys() {
        let state = AuthState::parse("ops:secret-1, secret-2 ,,bad:");
        assert!(state.is_enabled());
        assert_eq!(
            state.authenticate("secret-1"),
            Some(AuthContext {
                key_id: "ops".into()
            })
        );
        assert_eq!(state.authenticate("secret-2").unwrap().key_id, "key-02");
        assert!(state.authenticate("bad").is_none());
        assert!(state.authenticate("").is_none());
    }

    #[test]
    fn empty_configuration_disables_admin() {
        assert!(!AuthState::parse("").is_enabled());
        assert!(!AuthState::parse(" , ").is_enabled());
    }

    #[test]
    fn extracts_bearer_before_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Worker-Key", HeaderValue::from_static("from-header"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-header"));

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer  from-bearer "),
        );
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn blank_keys_are_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Worker-Key", HeaderValue::from_static("  "));
        assert!(extract_api_key(&headers).is_none());
    }

    #[test]
    fn rejections_are_json_401s() {
        let response = unauthorized_response("missing_api_key", "nope");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
