//! Session/Token Manager.
//!
//! Holds the short-lived access token and the longer-lived refresh token,
//! refreshes the access token on demand (shared by concurrent callers) and
//! proactively on a timer, and announces when the user has to log in again.
//! Tokens live in a `CredentialStore`; restaurant and user ids in
//! `LocalState`.

use reqwest::Method;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::ClientConfig;
use crate::error::{RequestFailed, SessionError};
use crate::local_state::LocalState;
use crate::storage::{CredentialStore, KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Notifications for whoever drives navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    TokenRefreshed,
    /// The session is gone; redirect to the login flow.
    LoginRequired { reason: String },
    LoggedOut,
}

/// What a successful login returned.
#[derive(Debug, Clone)]
pub struct LoginInfo {
    pub user_id: Option<String>,
    pub restaurant_id: Option<String>,
    pub user: Value,
}

pub struct SessionManager {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    local: Arc<LocalState>,
    /// Serialises on-demand refreshes so concurrent 401s share one call.
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_scheduled: AtomicBool,
    refresh_task: Mutex<Option<CancellationToken>>,
    last_redirect: Mutex<Option<Instant>>,
    events: broadcast::Sender<SessionEvent>,
}

fn first_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

impl SessionManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        local: Arc<LocalState>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            transport,
            credentials,
            local,
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_scheduled: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
            last_redirect: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }

    pub fn access_token(&self) -> Option<Zeroizing<String>> {
        self.credentials.get(KEY_ACCESS_TOKEN)
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    pub fn local(&self) -> &Arc<LocalState> {
        &self.local
    }

    // -----------------------------------------------------------------------
    // Login / logout
    // -----------------------------------------------------------------------

    /// Log in with email and password. The request is aborted after the
    /// login timeout.
    pub async fn login(
        self: &Arc<Self>,
        email: &str,
        password: &str,
    ) -> Result<LoginInfo, SessionError> {
        let url = self.config.resolve("/auth/login");
        let request = HttpRequest::new(Method::POST, url, self.config.login_timeout)
            .with_body(Some(json!({ "email": email.trim(), "password": password })));

        let resp = match tokio::time::timeout(
            self.config.login_timeout,
            self.transport.send(request),
        )
        .await
        {
            Err(_) | Ok(Err(RequestFailed::Timeout)) => {
                warn!("login timed out");
                return Err(SessionError::LoginTimeout);
            }
            Ok(Err(e)) => return Err(SessionError::LoginFailed(e.to_string())),
            Ok(Ok(resp)) => resp,
        };

        let body = parse_json_body(&resp).map_err(SessionError::LoginFailed)?;
        if !resp.is_success() {
            let message = first_str(&body, &["message", "error"])
                .unwrap_or_else(|| format!("HTTP {}", resp.status));
            return Err(SessionError::LoginFailed(message));
        }

        let access = first_str(&body, &["accessToken", "token", "access_token"])
            .ok_or_else(|| SessionError::LoginFailed("response has no access token".into()))?;
        self.credentials.set(KEY_ACCESS_TOKEN, &access)?;
        if let Some(refresh) = first_str(&body, &["refreshToken", "refresh_token"]) {
            self.credentials.set(KEY_REFRESH_TOKEN, &refresh)?;
        }

        let user = body.get("user").cloned().unwrap_or(Value::Null);
        let user_id = first_str(&user, &["_id", "id"]);
        let restaurant_id = first_str(&body, &["restaurantId"])
            .or_else(|| first_str(&user, &["restaurantId", "restaurant"]));
        if let Some(id) = restaurant_id.as_deref() {
            self.local.set_restaurant_id(id)?;
        }
        if let Some(id) = user_id.as_deref() {
            self.local.set_user_id(id)?;
        }

        *self
            .last_redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!(user_id = ?user_id, restaurant_id = ?restaurant_id, "login successful");
        self.emit(SessionEvent::LoggedIn);
        self.schedule_proactive_refresh();

        Ok(LoginInfo {
            user_id,
            restaurant_id,
            user,
        })
    }

    /// Clear credentials and session keys and stop the refresh timer.
    pub fn logout(&self) {
        self.clear_session_state();
        info!("logged out");
        self.emit(SessionEvent::LoggedOut);
    }

    fn clear_session_state(&self) {
        self.stop_proactive_refresh();
        if let Err(e) = self.credentials.clear() {
            warn!(error = %e, "failed to clear credentials");
        }
        if let Err(e) = self.local.clear_session() {
            warn!(error = %e, "failed to clear local session state");
        }
    }

    /// Session-fatal failure: wipe everything and ask for a new login.
    pub fn force_logout(&self, reason: &str) {
        warn!(reason, "session is no longer valid, forcing logout");
        self.clear_session_state();
        self.signal_login_required(reason);
    }

    /// Emit `LoginRequired` unless one was emitted within the debounce
    /// window. Returns whether the event was emitted.
    pub fn signal_login_required(&self, reason: &str) -> bool {
        let now = Instant::now();
        {
            let mut last = self
                .last_redirect
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.config.redirect_debounce {
                    debug!(reason, "login redirect already signalled, skipping");
                    return false;
                }
            }
            *last = Some(now);
        }
        self.emit(SessionEvent::LoginRequired {
            reason: reason.to_string(),
        });
        true
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Exchange the stored refresh token for a new access token.
    pub async fn refresh(&self) -> Result<Zeroizing<String>, SessionError> {
        let refresh_token = self
            .credentials
            .get(KEY_REFRESH_TOKEN)
            .ok_or(SessionError::SessionLost)?;

        let url = self.config.resolve("/auth/refresh");
        let request = HttpRequest::new(Method::POST, url, self.config.request_timeout)
            .with_body(Some(json!({ "refreshToken": refresh_token.as_str() })));

        let resp = self
            .transport
            .send(request)
            .await
            .map_err(|e| SessionError::RefreshFailed(e.to_string()))?;
        if !resp.is_success() {
            return Err(SessionError::RefreshFailed(format!("HTTP {}", resp.status)));
        }

        let body = parse_json_body(&resp).map_err(SessionError::RefreshFailed)?;
        let access = first_str(&body, &["accessToken", "token", "access_token"])
            .map(Zeroizing::new)
            .ok_or_else(|| SessionError::RefreshFailed("response has no access token".into()))?;

        self.credentials.set(KEY_ACCESS_TOKEN, &access)?;
        if let Some(rotated) = first_str(&body, &["refreshToken", "refresh_token"]) {
            self.credentials.set(KEY_REFRESH_TOKEN, &rotated)?;
        }

        debug!("access token refreshed");
        self.emit(SessionEvent::TokenRefreshed);
        Ok(access)
    }

    /// Refresh on behalf of a request that was rejected while using
    /// `stale`. Callers that arrive while another refresh is running wait
    /// for it and reuse its token instead of issuing their own. Any failure
    /// here is session-fatal.
    pub async fn refresh_after_rejection(
        &self,
        stale: Option<&str>,
    ) -> Result<Zeroizing<String>, SessionError> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(current) = self.access_token() {
            if Some(current.as_str()) != stale {
                debug!("token already refreshed by a concurrent caller");
                return Ok(current);
            }
        }

        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e) => {
                self.force_logout(&e.to_string());
                Err(e)
            }
        }
    }

    /// Start the background refresh timer. Only the first call has an
    /// effect until the timer is stopped; returns whether this call started
    /// it. Must run inside a tokio runtime.
    pub fn schedule_proactive_refresh(self: &Arc<Self>) -> bool {
        if self.refresh_scheduled.swap(true, Ordering::SeqCst) {
            return false;
        }

        let shutdown = CancellationToken::new();
        *self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown.clone());

        let manager = Arc::downgrade(self);
        let period = self.config.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // skip immediate tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.proactive_refresh().await;
                    }
                }
            }
            debug!("proactive refresh timer stopped");
        });

        info!(interval_secs = period.as_secs(), "proactive token refresh scheduled");
        true
    }

    fn stop_proactive_refresh(&self) {
        if let Some(token) = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        self.refresh_scheduled.store(false, Ordering::SeqCst);
    }

    /// One timer tick. Failures are logged and retried on the next tick or
    /// by the next rejected request; only a missing refresh token ends the
    /// session.
    async fn proactive_refresh(&self) {
        let _gate = self.refresh_gate.lock().await;
        match self.refresh().await {
            Ok(_) => info!("proactive token refresh succeeded"),
            Err(SessionError::SessionLost) => {
                self.force_logout("refresh token missing");
            }
            Err(e) => warn!(error = %e, "proactive token refresh failed"),
        }
    }
}

fn parse_json_body(resp: &HttpResponse) -> Result<Value, String> {
    if resp.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&resp.body).map_err(|e| format!("invalid JSON from backend: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, harness_logged_in};
    use crate::transport::testing::{path_of, ScriptedTransport};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn refresh_ok() -> ScriptedTransport {
        ScriptedTransport::new(|req| match path_of(req) {
            "/auth/refresh" => Ok(HttpResponse::json(
                200,
                &json!({ "accessToken": "access-1", "refreshToken": "refresh-1" }),
            )),
            other => panic!("unexpected request {other}"),
        })
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_is_session_lost() {
        let h = harness(refresh_ok());
        let err = h.session.refresh().await.expect_err("no refresh token");
        assert_eq!(err, SessionError::SessionLost);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn refresh_persists_rotated_tokens() {
        let h = harness_logged_in(refresh_ok());
        let token = h.session.refresh().await.expect("refresh");
        assert_eq!(token.as_str(), "access-1");
        assert_eq!(
            h.credentials.get(KEY_REFRESH_TOKEN).as_deref().map(String::as_str),
            Some("refresh-1")
        );
        let sent = h.transport.requests();
        assert_eq!(
            sent[0].body.as_ref().and_then(|b| b.get("refreshToken")),
            Some(&json!("refresh-0"))
        );
    }

    #[tokio::test]
    async fn rejected_refresh_is_refresh_failed() {
        let h = harness_logged_in(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(401, &json!({ "message": "expired" })))
        }));
        let err = h.session.refresh().await.expect_err("rejected");
        assert!(matches!(err, SessionError::RefreshFailed(_)));
        // Plain refresh does not end the session by itself.
        assert!(h.session.is_authenticated());
    }

    #[tokio::test]
    async fn failed_refresh_after_rejection_forces_logout() {
        let h = harness_logged_in(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(401, &json!({})))
        }));
        let mut events = h.session.subscribe();
        let err = h
            .session
            .refresh_after_rejection(Some("access-0"))
            .await
            .expect_err("refresh rejected");
        assert!(matches!(err, SessionError::RefreshFailed(_)));
        assert!(!h.session.is_authenticated());
        assert_eq!(h.local.restaurant_id(), None);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::LoginRequired { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_is_idempotent() {
        let h = harness_logged_in(refresh_ok());
        assert!(h.session.schedule_proactive_refresh());
        assert!(!h.session.schedule_proactive_refresh());
        h.session.logout();
        assert!(h.session.schedule_proactive_refresh());
        h.session.logout();
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_fires_once_per_interval() {
        let h = harness_logged_in(refresh_ok());
        h.session.schedule_proactive_refresh();
        h.session.schedule_proactive_refresh();

        tokio::time::sleep(h.config.refresh_interval + Duration::from_secs(1)).await;
        assert_eq!(h.transport.count(Method::POST, "/auth/refresh"), 1);
        assert_eq!(
            h.session.access_token().as_deref().map(String::as_str),
            Some("access-1")
        );

        tokio::time::sleep(h.config.refresh_interval).await;
        assert_eq!(h.transport.count(Method::POST, "/auth/refresh"), 2);
        h.session.logout();
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_without_refresh_token_requires_login() {
        let h = harness_logged_in(refresh_ok());
        h.credentials.delete(KEY_REFRESH_TOKEN).expect("drop refresh token");
        let mut events = h.session.subscribe();

        h.session.schedule_proactive_refresh();
        tokio::time::sleep(h.config.refresh_interval + Duration::from_secs(1)).await;

        assert!(h.transport.requests().is_empty());
        assert!(!h.session.is_authenticated());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::LoginRequired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_failure_keeps_session() {
        let h = harness_logged_in(ScriptedTransport::new(|_| {
            Err(RequestFailed::Network("offline".into()))
        }));
        h.session.schedule_proactive_refresh();
        tokio::time::sleep(h.config.refresh_interval + Duration::from_secs(1)).await;

        assert_eq!(h.transport.count(Method::POST, "/auth/refresh"), 1);
        assert!(h.session.is_authenticated());
        h.session.logout();
    }

    #[tokio::test]
    async fn login_stores_tokens_and_ids() {
        let h = harness(ScriptedTransport::new(|req| {
            assert_eq!(path_of(req), "/auth/login");
            Ok(HttpResponse::json(
                200,
                &json!({
                    "token": "access-9",
                    "refreshToken": "refresh-9",
                    "user": { "_id": "u9", "restaurantId": "rest-9" }
                }),
            ))
        }));
        let mut events = h.session.subscribe();

        let info = h
            .session
            .login(" chef@example.com ", "secret")
            .await
            .expect("login");
        assert_eq!(info.user_id.as_deref(), Some("u9"));
        assert_eq!(info.restaurant_id.as_deref(), Some("rest-9"));
        assert_eq!(h.local.restaurant_id().as_deref(), Some("rest-9"));
        assert_eq!(h.local.user_id().as_deref(), Some("u9"));
        assert_eq!(
            h.session.access_token().as_deref().map(String::as_str),
            Some("access-9")
        );
        assert_eq!(events.try_recv(), Ok(SessionEvent::LoggedIn));

        let sent = h.transport.requests();
        assert_eq!(
            sent[0].body.as_ref().and_then(|b| b.get("email")),
            Some(&json!("chef@example.com"))
        );
        h.session.logout();
    }

    #[tokio::test]
    async fn login_rejection_reports_backend_message() {
        let h = harness(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(
                401,
                &json!({ "message": "Identifiants invalides" }),
            ))
        }));
        let err = h.session.login("a@b.c", "bad").await.expect_err("rejected");
        assert_eq!(
            err,
            SessionError::LoginFailed("Identifiants invalides".into())
        );
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn login_times_out() {
        let h = harness(
            ScriptedTransport::new(|_| Ok(HttpResponse::json(200, &json!({ "token": "late" }))))
                .with_delay(Duration::from_secs(60)),
        );
        let err = h.session.login("a@b.c", "pw").await.expect_err("timeout");
        assert_eq!(err, SessionError::LoginTimeout);
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn login_required_is_debounced() {
        let h = harness(refresh_ok());
        let mut events = h.session.subscribe();

        assert!(h.session.signal_login_required("first"));
        assert!(!h.session.signal_login_required("second"));
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::LoginRequired { reason }) if reason == "first"
        ));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        tokio::time::advance(h.config.redirect_debounce + Duration::from_millis(1)).await;
        assert!(h.session.signal_login_required("third"));
    }
}
