//! Mock delivery targets.

use std::time::Duration;

use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// A wiremock server standing in for a tenant endpoint.
pub struct MockTarget {
    server: MockServer,
}

impl MockTarget {
    /// Starts a server on a random port.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Full URL of `route` on this server.
    pub fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    /// Underlying server, for custom mocks.
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Every request to `route`, under any method, answers `status`.
    pub async fn always(&self, route: &str, status: u16) {
        Mock::given(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// POSTs to `route` answer each status in turn; the last one repeats.
    pub async fn sequence(&self, route: &str, statuses: &[u16]) {
        let Some((last, rest)) = statuses.split_last() else { return };
        for status in rest {
            Mock::given(method("POST"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        self.always(route, *last).await;
    }

    /// POSTs to `route` answer 429 with `Retry-After: seconds` once, then 200.
    pub async fn rate_limited_once(&self, route: &str, seconds: u64) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", seconds.to_string()))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
        self.always(route, 200).await;
    }

    /// Requests to `route` answer 200 after `delay`.
    pub async fn slow(&self, route: &str, delay: Duration) {
        Mock::given(path(route))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |r| r.len())
    }

    /// JSON bodies received so far, in arrival order. Empty bodies are
    /// skipped.
    pub async fn received_json(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| !r.body.is_empty())
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }
}
