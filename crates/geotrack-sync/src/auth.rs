//! # Auth Provider
//!
//! Hands out a usable bearer [`Credential`], refreshing it when it is expired
//! or close to expiry.
//!
//! ## Refresh Flow
//! ```text
//!   current_credential()
//!        │
//!        ├── cached & outside refresh margin ──────────────► Ok(cached)
//!        │
//!        ▼
//!   refresh_lock (one refresh at a time)
//!        │
//!        ├── someone refreshed while we waited ────────────► their result
//!        │
//!        ├── refresh token known ──► source.refresh()
//!        │                              └─ SessionExpired ──► source.sign_in()
//!        └── no session ───────────► source.sign_in()
//!
//!   Revoked      → session dropped, error surfaces (terminal)
//!   Unavailable  → cached token if it has not expired yet, else error
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use geotrack_core::Credential;

use crate::error::AuthError;

/// A credential as handed out by the identity backend.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub credential: Credential,
    /// Long-lived token used to obtain the next credential.
    pub refresh_token: Option<String>,
}

/// Where credentials come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Establishes a new identity and returns its first credential.
    async fn sign_in(&self) -> Result<IssuedCredential, AuthError>;

    /// Exchanges a refresh token for a fresh credential.
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedCredential, AuthError>;
}

#[derive(Debug, Clone)]
struct Session {
    credential: Credential,
    refresh_token: Option<String>,
    /// The backend refused the token; never hand it out again.
    invalidated: bool,
}

impl Session {
    fn usable(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        !self.invalidated && !self.credential.needs_refresh(margin, now)
    }
}

/// Caches one session and refreshes it single-flight.
pub struct AuthProvider {
    source: Arc<dyn CredentialSource>,
    refresh_margin: Duration,
    session: RwLock<Option<Session>>,
    /// Outcome of the last refresh, handed to callers that waited on it.
    refresh_lock: Mutex<Option<Result<Credential, AuthError>>>,
    generation: AtomicU64,
    source_calls: AtomicU64,
}

impl AuthProvider {
    pub fn new(source: Arc<dyn CredentialSource>, refresh_margin: Duration) -> Self {
        AuthProvider {
            source,
            refresh_margin,
            session: RwLock::new(None),
            refresh_lock: Mutex::new(None),
            generation: AtomicU64::new(0),
            source_calls: AtomicU64::new(0),
        }
    }

    /// Returns a credential that is valid beyond the refresh margin.
    ///
    /// Concurrent callers that find the cache stale queue on one lock; the
    /// first performs the refresh, the rest reuse its outcome.
    pub async fn current_credential(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.cached(Utc::now()).await {
            return Ok(credential);
        }

        let observed = self.generation.load(Ordering::Acquire);
        let mut last_outcome = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            let now = Utc::now();
            if let Some(credential) = self.cached(now).await {
                return Ok(credential);
            }
            match last_outcome.clone() {
                // a fallback credential that has since expired is not reused
                Some(Ok(credential)) if !credential.is_expired(now) => {
                    debug!("Reusing credential from concurrent refresh");
                    return Ok(credential);
                }
                Some(Err(err)) => {
                    debug!(?err, "Reusing outcome of concurrent refresh");
                    return Err(err);
                }
                _ => {}
            }
        }

        let outcome = self.refresh_locked().await;
        *last_outcome = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    async fn cached(&self, now: DateTime<Utc>) -> Option<Credential> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.usable(self.refresh_margin, now))
            .map(|s| s.credential.clone())
    }

    async fn refresh_locked(&self) -> Result<Credential, AuthError> {
        let previous = self.session.read().await.clone();
        let refresh_token = previous.as_ref().and_then(|s| s.refresh_token.clone());

        self.source_calls.fetch_add(1, Ordering::Relaxed);
        let result = match refresh_token {
            Some(token) => match self.source.refresh(&token).await {
                Err(AuthError::SessionExpired(reason)) => {
                    warn!(%reason, "Refresh token rejected, signing in again");
                    self.source_calls.fetch_add(1, Ordering::Relaxed);
                    self.source.sign_in().await
                }
                other => other,
            },
            None => {
                debug!("No session, signing in");
                self.source.sign_in().await
            }
        };

        match result {
            Ok(issued) => {
                info!(
                    subject = %issued.credential.subject,
                    expires_at = %issued.credential.expires_at,
                    "Credential refreshed"
                );
                let credential = issued.credential.clone();
                // keep the old refresh token when the source did not rotate it
                let refresh_token = issued
                    .refresh_token
                    .or_else(|| previous.and_then(|s| s.refresh_token));
                *self.session.write().await = Some(Session {
                    credential: issued.credential,
                    refresh_token,
                    invalidated: false,
                });
                Ok(credential)
            }
            Err(AuthError::Revoked(reason)) => {
                error!(%reason, "Account revoked, dropping session");
                *self.session.write().await = None;
                Err(AuthError::Revoked(reason))
            }
            Err(AuthError::Unavailable(reason)) => {
                let now = Utc::now();
                match previous.filter(|s| !s.invalidated && !s.credential.is_expired(now)) {
                    Some(session) => {
                        warn!(%reason, "Refresh failed, using cached credential until expiry");
                        Ok(session.credential)
                    }
                    None => {
                        warn!(%reason, "Refresh failed and no usable credential");
                        Err(AuthError::Unavailable(reason))
                    }
                }
            }
            Err(err) => {
                warn!(?err, "Credential refresh failed");
                Err(err)
            }
        }
    }

    /// Marks the cached credential as unusable (e.g. the backend answered
    /// 401). The refresh token is kept, so the next call refreshes.
    pub async fn invalidate(&self) {
        if let Some(session) = self.session.write().await.as_mut() {
            debug!("Credential invalidated");
            session.invalidated = true;
        }
    }

    /// Forgets the session entirely; the next call signs in again.
    pub async fn sign_out(&self) {
        *self.session.write().await = None;
        *self.refresh_lock.lock().await = None;
        info!("Signed out");
    }

    /// How many times the credential source was called.
    pub fn refresh_count(&self) -> u64 {
        self.source_calls.load(Ordering::Relaxed)
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }
}

impl std::fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProvider")
            .field("refresh_margin", &self.refresh_margin)
            .field("refresh_count", &self.refresh_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    struct ScriptedSource {
        sign_ins: AtomicU32,
        refreshes: AtomicU32,
        sign_in_script: std::sync::Mutex<VecDeque<Result<IssuedCredential, AuthError>>>,
        refresh_script: std::sync::Mutex<VecDeque<Result<IssuedCredential, AuthError>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new() -> Self {
            ScriptedSource {
                sign_ins: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                sign_in_script: Default::default(),
                refresh_script: Default::default(),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn push_sign_in(&self, result: Result<IssuedCredential, AuthError>) {
            self.sign_in_script.lock().unwrap().push_back(result);
        }

        fn push_refresh(&self, result: Result<IssuedCredential, AuthError>) {
            self.refresh_script.lock().unwrap().push_back(result);
        }
    }

    fn issued(token: &str, valid_for: chrono::Duration) -> IssuedCredential {
        IssuedCredential {
            credential: Credential::new(token, Utc::now() + valid_for, "device-uid"),
            refresh_token: Some(format!("refresh-{token}")),
        }
    }

    #[async_trait]
    impl CredentialSource for ScriptedSource {
        async fn sign_in(&self) -> Result<IssuedCredential, AuthError> {
            self.sign_ins.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sign_in_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(issued("signed-in", chrono::Duration::hours(1))))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<IssuedCredential, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.refresh_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(issued("refreshed", chrono::Duration::hours(1))))
        }
    }

    fn provider(source: Arc<ScriptedSource>) -> AuthProvider {
        AuthProvider::new(source, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_first_call_signs_in_then_caches() {
        let source = Arc::new(ScriptedSource::new());
        let auth = provider(source.clone());

        let first = auth.current_credential().await.unwrap();
        let second = auth.current_credential().await.unwrap();

        assert_eq!(first.token, "signed-in");
        assert_eq!(first, second);
        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 1);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_near_expiry_triggers_refresh() {
        let source = Arc::new(ScriptedSource::new());
        // inside the 5 minute margin
        source.push_sign_in(Ok(issued("short", chrono::Duration::minutes(2))));
        let auth = provider(source.clone());

        assert_eq!(auth.current_credential().await.unwrap().token, "short");
        assert_eq!(auth.current_credential().await.unwrap().token, "refreshed");
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let source = Arc::new(ScriptedSource::new().with_delay(Duration::from_millis(50)));
        let auth = Arc::new(provider(source.clone()));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let auth = auth.clone();
            tasks.push(tokio::spawn(async move { auth.current_credential().await }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().token, "signed-in");
        }
        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let source = Arc::new(ScriptedSource::new().with_delay(Duration::from_millis(50)));
        source.push_sign_in(Err(AuthError::Unavailable("offline".into())));
        let auth = Arc::new(provider(source.clone()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let auth = auth.clone();
            tasks.push(tokio::spawn(async move { auth.current_credential().await }));
        }

        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(AuthError::Unavailable(_))));
        }
        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_session_falls_back_to_sign_in() {
        let source = Arc::new(ScriptedSource::new());
        source.push_sign_in(Ok(issued("first", chrono::Duration::minutes(1))));
        source.push_refresh(Err(AuthError::SessionExpired("INVALID_REFRESH_TOKEN".into())));
        source.push_sign_in(Ok(issued("second", chrono::Duration::hours(1))));
        let auth = provider(source.clone());

        auth.current_credential().await.unwrap();
        let credential = auth.current_credential().await.unwrap();

        assert_eq!(credential.token, "second");
        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 2);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revocation_clears_session() {
        let source = Arc::new(ScriptedSource::new());
        source.push_sign_in(Ok(issued("first", chrono::Duration::minutes(1))));
        source.push_refresh(Err(AuthError::Revoked("USER_DISABLED".into())));
        let auth = provider(source.clone());

        auth.current_credential().await.unwrap();
        let err = auth.current_credential().await.unwrap_err();
        assert!(!err.is_retryable());

        // no refresh token left, so the next attempt is a sign-in
        auth.current_credential().await.unwrap();
        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_serves_unexpired_cache() {
        let source = Arc::new(ScriptedSource::new());
        source.push_sign_in(Ok(issued("first", chrono::Duration::minutes(2))));
        source.push_refresh(Err(AuthError::Unavailable("timeout".into())));
        let auth = provider(source.clone());

        auth.current_credential().await.unwrap();
        let credential = auth.current_credential().await.unwrap();
        assert_eq!(credential.token, "first");
    }

    #[tokio::test]
    async fn test_unavailable_fallback_is_shared_by_waiters() {
        let source = Arc::new(ScriptedSource::new().with_delay(Duration::from_millis(100)));
        // inside the 5 minute margin but not yet expired
        source.push_sign_in(Ok(issued("cached", chrono::Duration::minutes(2))));
        source.push_refresh(Err(AuthError::Unavailable("gateway timeout".into())));
        let auth = Arc::new(provider(source.clone()));
        auth.current_credential().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let auth = auth.clone();
            tasks.push(tokio::spawn(async move { auth.current_credential().await }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().token, "cached");
        }
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_without_cache_fails() {
        let source = Arc::new(ScriptedSource::new());
        source.push_sign_in(Err(AuthError::Unavailable("dns".into())));
        let auth = provider(source.clone());

        let err = auth.current_credential().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(ScriptedSource::new());
        let auth = provider(source.clone());

        auth.current_credential().await.unwrap();
        auth.invalidate().await;
        let credential = auth.current_credential().await.unwrap();

        assert_eq!(credential.token, "refreshed");
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_forgets_identity() {
        let source = Arc::new(ScriptedSource::new());
        let auth = provider(source.clone());

        auth.current_credential().await.unwrap();
        auth.sign_out().await;
        auth.current_credential().await.unwrap();

        assert_eq!(source.sign_ins.load(Ordering::SeqCst), 2);
    }
}
