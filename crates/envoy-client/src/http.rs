//! HTTP transport seam.
//!
//! [`HttpBackend`] is the only place the client touches the network. The
//! production implementation is [`ReqwestBackend`]; [`FakeBackend`] serves
//! scripted responses for tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{ClientError, Result};

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("envoy-bridge/", env!("CARGO_PKG_VERSION"));

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Value of the `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// Creates a JSON response.
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: body.to_string(),
        }
    }

    /// Creates a plain-text response.
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Parses the body as JSON.
    ///
    /// Gateways occasionally label JSON as `text/html`; the body is parsed
    /// regardless of the declared content type.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] with a body preview if parsing fails.
    pub fn parse_json(&self, endpoint: &str) -> Result<Value> {
        serde_json::from_str(&self.body).map_err(|e| {
            let content_type = self.content_type.as_deref().unwrap_or("none");
            ClientError::parse(
                endpoint,
                format!("{e} (content type {content_type})"),
                &self.body,
            )
        })
    }
}

/// Minimal async HTTP capability used by the session manager and API.
#[allow(async_fn_in_trait)]
pub trait HttpBackend: Send + Sync + 'static {
    /// POSTs a JSON body.
    fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;

    /// Issues a GET, optionally with a bearer token.
    fn get(
        &self,
        url: &str,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;
}

/// [`HttpBackend`] over `reqwest`.
///
/// Certificate and hostname verification are disabled: gateways serve
/// self-signed certificates on the local network.
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    /// Builds the underlying client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ClientError::Transport {
                endpoint: "client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn execute(&self, url: &str, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = request.send().await.map_err(|e| transport(url, &e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| transport(url, &e))?;

        trace!(url, status, bytes = body.len(), "http response");
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

impl HttpBackend for ReqwestBackend {
    async fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> Result<HttpResponse> {
        let request = self.client.post(url).json(body).timeout(timeout);
        self.execute(url, request).await
    }

    async fn get(&self, url: &str, bearer: Option<&str>, timeout: Duration) -> Result<HttpResponse> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.execute(url, request).await
    }
}

fn transport(url: &str, err: &reqwest::Error) -> ClientError {
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    };
    ClientError::Transport {
        endpoint: url.to_string(),
        reason,
    }
}

/// A request observed by [`FakeBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// `GET` or `POST`.
    pub method: &'static str,
    /// Full request URL.
    pub url: String,
    /// Bearer token, if one was sent.
    pub bearer: Option<String>,
    /// JSON body, for POSTs.
    pub body: Option<Value>,
}

/// Scripted [`HttpBackend`] for tests.
///
/// Responses are registered per URL suffix. A route with several queued
/// responses serves them in order and then keeps repeating the last one.
/// Unrouted URLs get a 404.
#[derive(Debug, Default)]
pub struct FakeBackend {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    bearer_routes: Mutex<HashMap<(String, String), HttpResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    latency: Option<Duration>,
}

impl FakeBackend {
    /// Creates a backend with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for URLs ending with `suffix`.
    #[must_use]
    pub fn with_response(self, suffix: impl Into<String>, response: HttpResponse) -> Self {
        self.routes
            .lock()
            .entry(suffix.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Serves `response` for URLs ending with `suffix` only when called with `token`.
    ///
    /// Takes precedence over plain routes.
    #[must_use]
    pub fn with_token_response(
        self,
        suffix: impl Into<String>,
        token: impl Into<String>,
        response: HttpResponse,
    ) -> Self {
        self.bearer_routes
            .lock()
            .insert((suffix.into(), token.into()), response);
        self
    }

    /// Delays every response.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replaces the queued responses of a route.
    pub fn set_response(&self, suffix: impl Into<String>, response: HttpResponse) {
        self.routes
            .lock()
            .insert(suffix.into(), VecDeque::from([response]));
    }

    /// Returns every request seen so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Counts requests whose URL ends with `suffix`.
    #[must_use]
    pub fn count(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .count()
    }

    fn respond(&self, request: RecordedRequest) -> HttpResponse {
        let token_match = request.bearer.as_ref().and_then(|token| {
            self.bearer_routes
                .lock()
                .iter()
                .find(|((suffix, t), _)| request.url.ends_with(suffix.as_str()) && t == token)
                .map(|(_, response)| response.clone())
        });

        let response = token_match.or_else(|| {
            let mut routes = self.routes.lock();
            let queue = routes
                .iter_mut()
                .filter(|(suffix, _)| request.url.ends_with(suffix.as_str()))
                .max_by_key(|(suffix, _)| suffix.len())
                .map(|(_, queue)| queue)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });

        self.requests.lock().push(request);
        response.unwrap_or_else(|| HttpResponse::text(404, "not found"))
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl HttpBackend for FakeBackend {
    async fn post_json(&self, url: &str, body: &Value, _timeout: Duration) -> Result<HttpResponse> {
        self.delay().await;
        Ok(self.respond(RecordedRequest {
            method: "POST",
            url: url.to_string(),
            bearer: None,
            body: Some(body.clone()),
        }))
    }

    async fn get(&self, url: &str, bearer: Option<&str>, _timeout: Duration) -> Result<HttpResponse> {
        self.delay().await;
        Ok(self.respond(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            bearer: bearer.map(str::to_string),
            body: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn user_agent_carries_version() {
        assert!(USER_AGENT.starts_with("envoy-bridge/"));
    }

    #[test]
    fn parse_json_ignores_content_type() {
        let response = HttpResponse {
            status: 200,
            content_type: Some("text/html".to_string()),
            body: r#"{"wattsNow": 12}"#.to_string(),
        };
        let value = response.parse_json("/api/v1/production").unwrap();
        assert_eq!(value["wattsNow"], 12);
    }

    #[test]
    fn parse_json_reports_preview() {
        let response = HttpResponse::text(200, "<html>login required</html>");
        let err = response.parse_json("/ivp/meters").unwrap_err();

        let ClientError::Parse { endpoint, preview, reason } = err else {
            panic!("expected parse error");
        };
        assert_eq!(endpoint, "/ivp/meters");
        assert_eq!(preview, "<html>login required</html>");
        assert!(reason.contains("text/plain"));
    }

    #[tokio::test]
    async fn fake_backend_serves_queue_then_repeats_last() {
        let backend = FakeBackend::new()
            .with_response("/a", HttpResponse::text(401, "no"))
            .with_response("/a", HttpResponse::text(200, "yes"));

        let first = backend.get("https://h/a", None, TIMEOUT).await.unwrap();
        let second = backend.get("https://h/a", None, TIMEOUT).await.unwrap();
        let third = backend.get("https://h/a", None, TIMEOUT).await.unwrap();

        assert_eq!(first.status, 401);
        assert_eq!(second.status, 200);
        assert_eq!(third.status, 200);
        assert_eq!(backend.count("/a"), 3);
    }

    #[tokio::test]
    async fn fake_backend_prefers_longest_suffix() {
        let backend = FakeBackend::new()
            .with_response("/ivp/meters", HttpResponse::json(200, &json!([])))
            .with_response("/ivp/meters/readings", HttpResponse::json(200, &json!([{"eid": 1}])));

        let readings = backend
            .get("https://h/ivp/meters/readings", None, TIMEOUT)
            .await
            .unwrap();
        assert!(readings.body.contains("eid"));
    }

    #[tokio::test]
    async fn fake_backend_routes_by_token() {
        let backend = FakeBackend::new()
            .with_response("/x", HttpResponse::text(401, "expired"))
            .with_token_response("/x", "fresh", HttpResponse::text(200, "ok"));

        let stale = backend.get("https://h/x", Some("stale"), TIMEOUT).await.unwrap();
        let fresh = backend.get("https://h/x", Some("fresh"), TIMEOUT).await.unwrap();

        assert_eq!(stale.status, 401);
        assert_eq!(fresh.status, 200);
    }

    #[tokio::test]
    async fn fake_backend_unrouted_is_404() {
        let backend = FakeBackend::new();
        let body = json!({"a": 1});
        let response = backend.post_json("https://h/nowhere", &body, TIMEOUT).await.unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(backend.requests()[0].body, Some(body));
    }
}
