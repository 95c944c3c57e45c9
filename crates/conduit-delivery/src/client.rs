//! HTTP executor for rule deliveries.
//!
//! Sends one request under the rule's timeout and reports the raw response.
//! [`DeliveryResponse::classify`] turns it into success or a
//! [`DeliveryError`] for retry decisions.

use std::{error::Error as _, time::Duration};

use chrono::{DateTime, Utc};
use conduit_core::{
    models::{truncate_response_body, HttpMethod},
    redirect_policy, UrlPolicy,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    auth::AuthHeaders,
    error::{DeliveryError, Result},
};

/// Configuration for the delivery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Policy every redirect hop must pass.
    pub url_policy: UrlPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "conduit-delivery/0.1".to_string(),
            max_redirects: 3,
            url_policy: UrlPolicy::default(),
        }
    }
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Validated target URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Auth and custom headers.
    pub headers: AuthHeaders,
    /// Transformed payload; ignored for GET and DELETE.
    pub body: Value,
    /// Per-request timeout.
    pub timeout: Duration,
    /// 1-based attempt number, for logs.
    pub attempt: u32,
}

/// Response of one attempt, body already truncated.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, at most 5000 characters.
    pub body: String,
    /// Raw `Retry-After` header.
    pub retry_after: Option<String>,
}

impl DeliveryResponse {
    /// Whether the status is 2xx.
    pub const fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 300
    }

    /// Maps the status onto success or a classified error.
    ///
    /// `now` anchors HTTP-date `Retry-After` values.
    ///
    /// # Errors
    ///
    /// Returns the [`DeliveryError`] matching any non-2xx status.
    pub fn classify(self, now: DateTime<Utc>) -> Result<Self> {
        let status_code = self.status_code;
        match status_code {
            200..=299 => Ok(self),
            429 => Err(DeliveryError::RateLimited {
                retry_after: self.retry_after.as_deref().and_then(|v| parse_retry_after(v, now)),
                body: self.body,
            }),
            400..=499 => Err(DeliveryError::Client { status_code, body: self.body }),
            500..=599 => Err(DeliveryError::Server { status_code, body: self.body }),
            _ => Err(DeliveryError::UnexpectedStatus { status_code, body: self.body }),
        }
    }
}

/// Parses a `Retry-After` value in seconds or HTTP-date form.
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// HTTP client shared by every delivery.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect_policy(config.url_policy, config.max_redirects))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// Underlying reqwest client, shared with token pre-flight requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `request` and returns whatever response arrived.
    ///
    /// The reqwest timeout and an outer `tokio::time::timeout` both apply;
    /// the outer one drops the in-flight future.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Network` when no response arrived.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "http_attempt",
            url = %request.url,
            method = %request.method,
            attempt = request.attempt
        );
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        async move {
            let mut http = self.client.request(method, &request.url).timeout(request.timeout);

            for (name, value) in &request.headers {
                http = http.header(name.as_str(), value.as_str());
            }
            if request.method.carries_body() {
                http = http.json(&request.body);
            }

            let sent = tokio::time::timeout(request.timeout, async {
                let response = http.send().await?;
                let status_code = response.status().as_u16();
                let retry_after = retry_after_header(response.headers());
                let body = response.text().await?;
                Ok::<_, reqwest::Error>(DeliveryResponse {
                    status_code,
                    body: truncate_response_body(&body),
                    retry_after,
                })
            })
            .await;

            match sent {
                Ok(Ok(response)) => {
                    debug!(status = response.status_code, "received response");
                    Ok(response)
                },
                Ok(Err(e)) if e.is_timeout() => Err(DeliveryError::Timeout { timeout_ms }),
                Ok(Err(e)) if e.is_redirect() => {
                    let reason = e.source().map_or_else(|| e.to_string(), ToString::to_string);
                    warn!(reason = %reason, "redirect refused");
                    Err(DeliveryError::RedirectRejected { reason })
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "request failed");
                    Err(DeliveryError::network(e.to_string()))
                },
                Err(_elapsed) => Err(DeliveryError::Timeout { timeout_ms }),
            }
        }
        .instrument(span)
        .await
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<String> {
    headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()).map(str::to_string)
}
