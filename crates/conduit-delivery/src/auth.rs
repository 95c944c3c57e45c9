//! Outbound authentication headers.
//!
//! [`build_auth_headers`] turns a rule's `authType` and `authConfig` into
//! the headers of the delivery request. `OAUTH2` and `CUSTOM` fetch a token
//! first; every other type is a pure function of the config.

use std::{collections::BTreeMap, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use conduit_core::models::{AuthSettings, AuthType};
use conduit_transform::path::{FieldPath, Resolved};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::AuthError;

/// Header name to value, sorted for stable logs.
pub type AuthHeaders = BTreeMap<String, String>;

/// Default timeout for token endpoint calls.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the headers for `auth`.
///
/// `http` is used for token pre-flight requests, each bounded by
/// `token_timeout`.
///
/// # Errors
///
/// Returns an [`AuthError`] naming the missing field, the null header or the
/// token fetch stage that failed.
pub async fn build_auth_headers(
    auth: &AuthSettings,
    http: &reqwest::Client,
    token_timeout: Duration,
) -> Result<AuthHeaders, AuthError> {
    let kind = auth
        .kind()
        .map_err(|_| AuthError::UnsupportedType { auth_type: auth.auth_type.clone() })?;
    let config = &auth.config;
    let mut headers = AuthHeaders::new();

    match kind {
        AuthType::None => {},
        AuthType::ApiKey => {
            let name = required(config, "headerName")?;
            let key = required(config, "apiKey")?;
            headers.insert(name, key);
        },
        AuthType::Basic => {
            let username = required(config, "username")?;
            let password = required(config, "password")?;
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            headers.insert("Authorization".into(), format!("Basic {encoded}"));
        },
        AuthType::Bearer => {
            let token = required(config, "token")?;
            headers.insert("Authorization".into(), format!("Bearer {token}"));
        },
        AuthType::CustomHeaders => {
            let map = match config.get("headers") {
                Some(Value::Object(map)) => map,
                _ => config,
            };
            for (name, value) in map {
                let value = match value {
                    Value::Null => {
                        return Err(AuthError::NullHeaderValue { header: name.clone() });
                    },
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                headers.insert(name.clone(), value);
            }
        },
        AuthType::Oauth2 => {
            let token = fetch_oauth2_token(config, http, token_timeout).await?;
            headers.insert("Authorization".into(), format!("Bearer {token}"));
        },
        AuthType::Custom => {
            let name = optional(config, "tokenHeaderName").unwrap_or_else(|| "Authorization".into());
            let prefix = optional(config, "tokenHeaderPrefix").unwrap_or_else(|| "Bearer".into());
            let token = fetch_custom_token(config, http, token_timeout).await?;
            let value = if prefix.is_empty() { token } else { format!("{prefix} {token}") };
            headers.insert(name, value);
        },
    }

    debug!(auth_type = %kind, header_count = headers.len(), "built auth headers");
    Ok(headers)
}

fn optional(config: &Map<String, Value>, field: &str) -> Option<String> {
    match config.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required(config: &Map<String, Value>, field: &str) -> Result<String, AuthError> {
    optional(config, field).ok_or_else(|| AuthError::missing(field))
}

async fn fetch_oauth2_token(
    config: &Map<String, Value>,
    http: &reqwest::Client,
    timeout: Duration,
) -> Result<String, AuthError> {
    let endpoint = required(config, "tokenEndpoint")?;
    let client_id = required(config, "clientId")?;
    let client_secret = required(config, "clientSecret")?;

    let mut form = vec![
        ("grant_type", "client_credentials".to_string()),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    if let Some(scope) = optional(config, "scope") {
        form.push(("scope", scope));
    }

    let request = http.post(&endpoint).timeout(timeout).form(&form);
    let body = send_token_request(request).await?;
    resolve_token(&body, "access_token")
}

async fn fetch_custom_token(
    config: &Map<String, Value>,
    http: &reqwest::Client,
    timeout: Duration,
) -> Result<String, AuthError> {
    let endpoint = required(config, "tokenEndpoint")?;
    let method = optional(config, "tokenRequestMethod")
        .unwrap_or_else(|| "POST".into())
        .to_ascii_uppercase();
    let path = optional(config, "tokenResponsePath").unwrap_or_else(|| "access_token".into());

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| AuthError::UnsupportedType { auth_type: format!("CUSTOM ({method})") })?;
    let mut request = http.request(method.clone(), &endpoint).timeout(timeout);

    if let Some(Value::Object(extra)) = config.get("tokenRequestHeaders") {
        for (name, value) in extra {
            match value {
                Value::String(s) => request = request.header(name.as_str(), s.as_str()),
                Value::Null => {
                    return Err(AuthError::NullHeaderValue { header: name.clone() });
                },
                other => request = request.header(name.as_str(), other.to_string()),
            }
        }
    }

    if method != reqwest::Method::GET {
        request = match config.get("tokenRequestBody") {
            None | Some(Value::Null) => request,
            Some(Value::String(raw)) => request.body(raw.clone()),
            Some(body) => request.json(body),
        };
    }

    let body = send_token_request(request).await?;
    resolve_token(&body, &path)
}

async fn send_token_request(request: reqwest::RequestBuilder) -> Result<Value, AuthError> {
    let response = request.send().await.map_err(|e| {
        warn!(error = %e, "token endpoint unreachable");
        AuthError::TokenEndpointUnreachable { message: e.to_string() }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::TokenRequestFailed { status_code: status.as_u16() });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AuthError::TokenEndpointUnreachable { message: e.to_string() })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::TokenResponseNotJson { message: e.to_string() })
}

fn resolve_token(body: &Value, path: &str) -> Result<String, AuthError> {
    match FieldPath::parse(path).get(body) {
        Resolved::Value(Value::String(token)) if !token.is_empty() => Ok(token),
        Resolved::Value(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(AuthError::TokenPathUnresolved { path: path.to_string() }),
    }
}
