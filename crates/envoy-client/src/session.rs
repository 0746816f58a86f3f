//! Session lifecycle for the gateway's bearer token.
//!
//! Authentication is a three-step handshake:
//!
//! 1. Cloud login with the account credentials yields a `session_id`.
//! 2. Token exchange for the gateway's serial number yields a bearer token.
//! 3. The gateway itself validates the token.
//!
//! The resulting token is treated as valid for [`TOKEN_LIFETIME`]. All
//! authentication runs under one async mutex, so concurrent callers that find
//! the token expired share a single handshake.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpBackend, HttpResponse};

/// Enlighten cloud login endpoint.
pub const CLOUD_LOGIN_URL: &str = "https://enlighten.enphaseenergy.com/login/login.json";

/// Token exchange endpoint.
pub const TOKEN_URL: &str = "https://entrez.enphaseenergy.com/tokens";

/// Gateway-local token validation path.
pub const VALIDATION_PATH: &str = "/auth/check_jwt";

/// Marker the validation endpoint returns for a good token.
pub const VALID_TOKEN_MARKER: &str = "Valid token.";

/// How long a freshly validated token is trusted.
pub const TOKEN_LIFETIME: TimeDelta = TimeDelta::hours(12);

/// Tokens at or below this length are rejected as implausible.
const MIN_TOKEN_LEN: usize = 20;

/// Account credentials and the gateway they unlock.
#[derive(Clone)]
pub struct Credentials {
    /// Enlighten account e-mail.
    pub username: String,
    /// Enlighten account password.
    pub password: String,
    /// Serial number of the gateway.
    pub serial_number: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("serial_number", &self.serial_number)
            .finish()
    }
}

/// Settings for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the gateway, e.g. `https://envoy.local`.
    pub host: String,
    /// Account credentials.
    pub credentials: Credentials,
    /// Timeout for each handshake call.
    pub auth_timeout: Duration,
    /// Timeout for telemetry requests.
    pub request_timeout: Duration,
    /// Cloud login URL.
    pub login_url: String,
    /// Token exchange URL.
    pub token_url: String,
}

impl SessionConfig {
    /// Creates a configuration with the default endpoints and timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            credentials,
            auth_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            login_url: CLOUD_LOGIN_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
        }
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Sets the telemetry request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.host)
    }
}

/// Current authentication state.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Cloud session identifier.
    pub session_id: Option<String>,
    /// Validated bearer token.
    pub token: Option<String>,
    /// Advisory expiry, fixed at issuance.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Creates a session from an already validated token.
    #[must_use]
    pub fn issued(session_id: impl Into<String>, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            token: Some(token.into()),
            expires_at: Some(expires_at),
        }
    }

    /// Returns the token if it is still within its validity window.
    #[must_use]
    pub fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.token, self.expires_at) {
            (Some(token), Some(expires_at)) if now < expires_at => Some(token),
            _ => None,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id.as_deref().map(redact))
            .field("token", &self.token.as_deref().map(redact))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Default)]
struct AuthState {
    session: Session,
    last_failure: Option<String>,
}

/// Owns the session and performs authenticated gateway requests.
#[derive(Debug)]
pub struct SessionManager<B> {
    backend: Arc<B>,
    config: SessionConfig,
    state: Mutex<AuthState>,
    attempts: AtomicU64,
    completed: AtomicU64,
}

impl<B: HttpBackend> SessionManager<B> {
    /// Creates a manager with no session.
    #[must_use]
    pub fn new(backend: Arc<B>, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(AuthState::default()),
            attempts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Starts from an existing session instead of an empty one.
    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        Self {
            state: Mutex::new(AuthState {
                session,
                last_failure: None,
            }),
            ..self
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the number of handshakes started so far.
    #[must_use]
    pub fn authentication_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns a copy of the current session.
    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    /// Runs the full handshake unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Authentication`] if any step is rejected, or a
    /// transport error if a step cannot be reached.
    pub async fn authenticate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.run_handshake(&mut state).await.map(|_| ())
    }

    /// Returns a valid token, authenticating first if needed.
    ///
    /// Callers that queue up behind a failing handshake get its error instead
    /// of starting another one.
    ///
    /// # Errors
    ///
    /// Returns the handshake error if a fresh token could not be obtained.
    pub async fn ensure_valid(&self) -> Result<String> {
        let observed = self.completed.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        if let Some(token) = state.session.valid_token(Utc::now()) {
            return Ok(token.to_string());
        }
        // A handshake finished while we waited for the lock and it failed.
        if self.completed.load(Ordering::Acquire) != observed {
            if let Some(reason) = &state.last_failure {
                return Err(ClientError::Authentication {
                    step: "shared",
                    reason: reason.clone(),
                });
            }
        }

        self.run_handshake(&mut state).await
    }

    /// Replaces a token the gateway rejected.
    ///
    /// If another caller already replaced `stale`, its token is returned
    /// without a new handshake.
    ///
    /// # Errors
    ///
    /// Returns the handshake error if a fresh token could not be obtained.
    pub async fn force_reauthenticate(&self, stale: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(token) = state.session.valid_token(Utc::now()) {
            if token != stale {
                debug!("token already refreshed by another caller");
                return Ok(token.to_string());
            }
        }

        self.run_handshake(&mut state).await
    }

    /// GETs a gateway endpoint as JSON.
    ///
    /// A 401 triggers exactly one re-authentication and one retry.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub async fn request(&self, path: &str) -> Result<Value> {
        let token = self.ensure_valid().await?;

        match self.get_json(path, &token).await {
            Err(e) if e.is_unauthorized() => {
                warn!(endpoint = path, "gateway rejected token, re-authenticating");
                let fresh = self.force_reauthenticate(&token).await?;
                self.get_json(path, &fresh).await
            }
            other => other,
        }
    }

    async fn get_json(&self, path: &str, token: &str) -> Result<Value> {
        let response = self
            .backend
            .get(&self.config.url(path), Some(token), self.config.request_timeout)
            .await?;
        if !response.is_success() {
            return Err(ClientError::HttpStatus {
                endpoint: path.to_string(),
                status: response.status,
            });
        }
        response.parse_json(path)
    }

    async fn run_handshake(&self, state: &mut AuthState) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        info!(host = %self.config.host, "authenticating with gateway");

        let outcome = self.handshake().await;
        self.completed.fetch_add(1, Ordering::Release);

        match outcome {
            Ok(session) => {
                let token = session.token.clone().unwrap_or_default();
                info!(
                    expires_at = ?session.expires_at,
                    token = %redact(&token),
                    "gateway session established"
                );
                state.session = session;
                state.last_failure = None;
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "authentication failed");
                state.session = Session::default();
                state.last_failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Session> {
        let session_id = self.login().await?;
        let token = self.exchange_token(&session_id).await?;
        self.validate(&token).await?;
        Ok(Session::issued(session_id, token, Utc::now() + TOKEN_LIFETIME))
    }

    async fn login(&self) -> Result<String> {
        let credentials = &self.config.credentials;
        let body = json!({
            "user": {
                "email": credentials.username,
                "password": credentials.password,
            }
        });
        let response = self
            .backend
            .post_json(&self.config.login_url, &body, self.config.auth_timeout)
            .await?;
        require_success("login", &response)?;

        let reply = response.parse_json(&self.config.login_url).map_err(|e| auth("login", e))?;
        if reply.get("message").and_then(Value::as_str) != Some("success") {
            return Err(ClientError::Authentication {
                step: "login",
                reason: "cloud login was not accepted".to_string(),
            });
        }
        let session_id = match reply.get("session_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(ClientError::Authentication {
                    step: "login",
                    reason: "response has no session_id".to_string(),
                });
            }
        };

        debug!(session = %redact(&session_id), "cloud login succeeded");
        Ok(session_id)
    }

    async fn exchange_token(&self, session_id: &str) -> Result<String> {
        let credentials = &self.config.credentials;
        let body = json!({
            "session_id": session_id,
            "serial_num": credentials.serial_number,
            "username": credentials.username,
        });
        let response = self
            .backend
            .post_json(&self.config.token_url, &body, self.config.auth_timeout)
            .await?;
        require_success("token", &response)?;

        let token = response.body.trim();
        if token.len() <= MIN_TOKEN_LEN {
            return Err(ClientError::Authentication {
                step: "token",
                reason: format!("token of {} characters is implausibly short", token.len()),
            });
        }
        Ok(token.to_string())
    }

    async fn validate(&self, token: &str) -> Result<()> {
        let response = self
            .backend
            .get(
                &self.config.url(VALIDATION_PATH),
                Some(token),
                self.config.auth_timeout,
            )
            .await?;

        if response.status != 200 || !response.body.contains(VALID_TOKEN_MARKER) {
            return Err(ClientError::Authentication {
                step: "validate",
                reason: format!("gateway did not accept token (HTTP {})", response.status),
            });
        }
        Ok(())
    }
}

fn require_success(step: &'static str, response: &HttpResponse) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(ClientError::Authentication {
            step,
            reason: format!("HTTP {}", response.status),
        })
    }
}

fn auth(step: &'static str, err: ClientError) -> ClientError {
    ClientError::Authentication {
        step,
        reason: err.to_string(),
    }
}

/// Shortens a secret for logging.
fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FakeBackend;
    use test_case::test_case;

    const HOST: &str = "https://envoy.local";
    const TOKEN: &str = "eyJhbGciOiJFUzI1NiJ9.first-token";
    const FRESH_TOKEN: &str = "eyJhbGciOiJFUzI1NiJ9.fresh-token";

    fn credentials() -> Credentials {
        Credentials {
            username: "owner@example.com".to_string(),
            password: "hunter2".to_string(),
            serial_number: "122233344455".to_string(),
        }
    }

    fn happy_backend() -> FakeBackend {
        FakeBackend::new()
            .with_response(
                "/login/login.json",
                HttpResponse::json(200, &json!({"message": "success", "session_id": "abc123"})),
            )
            .with_response("/tokens", HttpResponse::text(200, TOKEN))
            .with_response(VALIDATION_PATH, HttpResponse::text(200, "<h2>Valid token.</h2>"))
    }

    fn manager(backend: FakeBackend) -> (Arc<FakeBackend>, SessionManager<FakeBackend>) {
        let backend = Arc::new(backend);
        let manager = SessionManager::new(Arc::clone(&backend), SessionConfig::new(HOST, credentials()));
        (backend, manager)
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", credentials());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("owner@example.com"));
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::issued("abc123", TOKEN, Utc::now());
        assert!(!format!("{session:?}").contains(TOKEN));
    }

    #[test]
    fn session_validity_window() {
        let now = Utc::now();
        let session = Session::issued("s", TOKEN, now + TimeDelta::minutes(1));
        assert_eq!(session.valid_token(now), Some(TOKEN));
        assert_eq!(session.valid_token(now + TimeDelta::minutes(2)), None);
        assert_eq!(Session::default().valid_token(now), None);
    }

    #[test]
    fn config_trims_trailing_slash() {
        let config = SessionConfig::new("https://envoy.local/", credentials());
        assert_eq!(config.url("/ivp/meters"), "https://envoy.local/ivp/meters");
    }

    #[tokio::test]
    async fn handshake_runs_three_steps() {
        let (backend, manager) = manager(happy_backend());
        manager.authenticate().await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].url, CLOUD_LOGIN_URL);
        assert_eq!(
            requests[0].body,
            Some(json!({"user": {"email": "owner@example.com", "password": "hunter2"}}))
        );
        assert_eq!(requests[1].url, TOKEN_URL);
        assert_eq!(
            requests[1].body,
            Some(json!({"session_id": "abc123", "serial_num": "122233344455", "username": "owner@example.com"}))
        );
        assert_eq!(requests[2].url, "https://envoy.local/auth/check_jwt");
        assert_eq!(requests[2].bearer.as_deref(), Some(TOKEN));

        let session = manager.session().await;
        assert_eq!(session.session_id.as_deref(), Some("abc123"));
        assert_eq!(session.token.as_deref(), Some(TOKEN));
        let expires_at = session.expires_at.unwrap();
        assert!(expires_at > Utc::now() + TimeDelta::hours(11));
        assert!(expires_at <= Utc::now() + TOKEN_LIFETIME);
    }

    #[test_case(json!({"message": "failure", "session_id": "abc"}) ; "login rejected")]
    #[test_case(json!({"message": "success"}) ; "missing session id")]
    #[test_case(json!({"message": "success", "session_id": ""}) ; "empty session id")]
    #[tokio::test]
    async fn login_failures_are_authentication_errors(reply: Value) {
        let backend = FakeBackend::new()
            .with_response("/login/login.json", HttpResponse::json(200, &reply));
        let (_, manager) = manager(backend);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication { step: "login", .. }));
        assert_eq!(manager.session().await, Session::default());
    }

    #[tokio::test]
    async fn login_http_error_is_authentication_error() {
        let backend = FakeBackend::new()
            .with_response("/login/login.json", HttpResponse::text(500, "oops"));
        let (_, manager) = manager(backend);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication { step: "login", .. }));
    }

    #[tokio::test]
    async fn short_token_is_rejected() {
        let backend = happy_backend();
        backend.set_response("/tokens", HttpResponse::text(200, "  short  "));
        let (backend, manager) = manager(backend);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication { step: "token", .. }));
        assert_eq!(backend.count(VALIDATION_PATH), 0);
    }

    #[tokio::test]
    async fn validation_without_marker_fails() {
        let backend = happy_backend();
        backend.set_response(VALIDATION_PATH, HttpResponse::text(200, "Invalid token."));
        let (_, manager) = manager(backend);

        let err = manager.authenticate().await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication { step: "validate", .. }));
    }

    #[tokio::test]
    async fn ensure_valid_reuses_live_token() {
        let (backend, manager) = manager(happy_backend());
        let first = manager.ensure_valid().await.unwrap();
        let second = manager.ensure_valid().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.count("/login/login.json"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ensure_valid_authenticates_once() {
        let backend = happy_backend().with_latency(Duration::from_millis(50));
        let (backend, manager) = manager(backend);
        let manager = Arc::new(manager);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.ensure_valid().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), TOKEN);
        }

        assert_eq!(backend.count("/login/login.json"), 1);
        assert_eq!(manager.authentication_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_failed_handshake() {
        let backend = FakeBackend::new()
            .with_response("/login/login.json", HttpResponse::text(503, "down"))
            .with_latency(Duration::from_millis(50));
        let (backend, manager) = manager(backend);
        let manager = Arc::new(manager);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.ensure_valid().await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }

        assert_eq!(backend.count("/login/login.json"), 1);
    }

    #[tokio::test]
    async fn expired_session_reauthenticates_once_before_request() {
        let backend = happy_backend()
            .with_response("/ivp/meters", HttpResponse::json(200, &json!([])));
        let backend = Arc::new(backend);
        let expired = Session::issued("old", "expired-token-0000000000", Utc::now() - TimeDelta::minutes(1));
        let manager = SessionManager::new(Arc::clone(&backend), SessionConfig::new(HOST, credentials()))
            .with_session(expired);

        let value = manager.request("/ivp/meters").await.unwrap();

        assert_eq!(value, json!([]));
        assert_eq!(backend.count("/login/login.json"), 1);
        assert_eq!(backend.count("/ivp/meters"), 1);
        assert_eq!(backend.requests().last().unwrap().bearer.as_deref(), Some(TOKEN));
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_reauth_and_one_retry() {
        let backend = happy_backend()
            .with_response("/ivp/meters", HttpResponse::text(401, "Unauthorized"))
            .with_token_response("/ivp/meters", TOKEN, HttpResponse::json(200, &json!([{"eid": 1}])));
        let backend = Arc::new(backend);
        let live = Session::issued("old", "revoked-token-000000000000", Utc::now() + TimeDelta::hours(1));
        let manager = SessionManager::new(Arc::clone(&backend), SessionConfig::new(HOST, credentials()))
            .with_session(live);

        let value = manager.request("/ivp/meters").await.unwrap();

        assert_eq!(value, json!([{"eid": 1}]));
        assert_eq!(backend.count("/login/login.json"), 1);
        assert_eq!(backend.count("/ivp/meters"), 2);
    }

    #[tokio::test]
    async fn persistent_unauthorized_surfaces_after_single_retry() {
        let backend = happy_backend()
            .with_response("/ivp/meters", HttpResponse::text(401, "Unauthorized"));
        let (backend, manager) = manager(backend);

        let err = manager.request("/ivp/meters").await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(backend.count("/login/login.json"), 2);
        assert_eq!(backend.count("/ivp/meters"), 2);
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let backend = happy_backend()
            .with_response("/ivp/meters", HttpResponse::text(503, "busy"));
        let (backend, manager) = manager(backend);

        let err = manager.request("/ivp/meters").await.unwrap_err();

        assert!(matches!(err, ClientError::HttpStatus { status: 503, .. }));
        assert_eq!(backend.count("/ivp/meters"), 1);
        assert_eq!(backend.count("/login/login.json"), 1);
    }

    #[tokio::test]
    async fn force_reauthenticate_skips_already_refreshed_token() {
        let backend = Arc::new(happy_backend());
        let live = Session::issued("s", FRESH_TOKEN, Utc::now() + TimeDelta::hours(1));
        let manager = SessionManager::new(Arc::clone(&backend), SessionConfig::new(HOST, credentials()))
            .with_session(live);

        let token = manager.force_reauthenticate("some-older-token").await.unwrap();

        assert_eq!(token, FRESH_TOKEN);
        assert_eq!(backend.count("/login/login.json"), 0);
    }
}
