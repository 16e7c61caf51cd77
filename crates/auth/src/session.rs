//! Session lifecycle manager
//!
//! Owns the session / user / profile triple for one application session and
//! drives it from provider events. Sign-in operations only talk to the
//! provider; the resulting state change arrives as an event and is applied by
//! the single listener task, strictly in delivery order.
//!
//! State is published through a `tokio::sync::watch` channel so readers get
//! consistent snapshots and can await transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use stratix_shared::{
    AreaId, AuthError, ProfilePatch, Session, SessionDuration, SignOutScope, UserIdentity,
    UserProfile, UserRole,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::mfa::MfaEngine;
use crate::profile_cache::ProfileCache;
use crate::provider::{AuthEvent, EventReceiver, IdentityProvider};
use crate::rate_limit::RateLimiter;
use crate::validator::SessionValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Uninitialized,
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Consistent view of the manager's state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session: Option<Session>,
    pub user: Option<UserIdentity>,
    pub profile: Option<UserProfile>,
    /// Most recent failure, cleared by the next successful transition
    pub last_error: Option<AuthError>,
    /// The state is last-known-good: a later refresh of it failed
    pub stale: bool,
}

impl SessionSnapshot {
    fn signed_out(last_error: Option<AuthError>) -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            last_error,
            ..Default::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    /// Profile, if present and active
    fn active_profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref().filter(|p| p.is_active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignInOptions {
    pub duration: SessionDuration,
}

impl SignInOptions {
    pub fn remember_me(remember_me: bool) -> Self {
        Self {
            duration: SessionDuration::from_remember_me(remember_me),
        }
    }
}

/// Failures that end the session rather than leave it stale
fn is_definitive(err: &AuthError) -> bool {
    matches!(
        err,
        AuthError::SessionExpired | AuthError::NotAuthenticated | AuthError::IdentityNotFound
    )
}

fn failure_key(email: &str) -> String {
    format!("signin:{}", email.trim().to_lowercase())
}

// =============================================================================
// Shared State
// =============================================================================

struct ManagerInner {
    provider: Arc<dyn IdentityProvider>,
    validator: Arc<SessionValidator>,
    profiles: Arc<ProfileCache>,
    failures: Option<RateLimiter>,
    state: watch::Sender<SessionSnapshot>,
    alive: AtomicBool,
}

impl ManagerInner {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Apply `f` to the state unless the manager has been shut down
    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) -> bool {
        if !self.is_alive() {
            tracing::debug!("Dropping state update after shutdown");
            return false;
        }
        self.state.send_modify(f);
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Verify `session`, resolve its profile and make it current
    async fn establish(&self, session: Session) -> Result<(), AuthError> {
        let identity = match self.validator.verify_client(&session).await {
            Ok(client) => client.identity,
            Err(e) => {
                self.degrade(Some(session), e.clone());
                return Err(e);
            }
        };
        self.adopt(session, identity).await
    }

    async fn adopt(&self, session: Session, user: UserIdentity) -> Result<(), AuthError> {
        let user_id = user.id;
        match self.profiles.resolve(user_id).await {
            Ok(profile) => {
                let applied = self.update(|s| {
                    *s = SessionSnapshot {
                        status: SessionStatus::Authenticated,
                        session: Some(session),
                        user: Some(user),
                        profile: Some(profile),
                        last_error: None,
                        stale: false,
                    };
                });
                if applied {
                    tracing::info!(user_id = %user_id, "Session authenticated");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Profile resolution failed");
                self.update(|s| {
                    let same_user = s.user.as_ref().is_some_and(|u| u.id == user_id);
                    if !same_user {
                        s.profile = None;
                    }
                    s.status = SessionStatus::Authenticated;
                    s.session = Some(session);
                    s.user = Some(user);
                    s.last_error = Some(e.clone());
                    s.stale = true;
                });
                Err(e)
            }
        }
    }

    /// Record a failure. Definitive ones end the session, the rest keep the
    /// last-known-good state and mark it stale.
    fn degrade(&self, session: Option<Session>, err: AuthError) {
        if is_definitive(&err) {
            tracing::warn!(error = %err, "Session no longer valid");
            self.forget_current();
            self.profiles.purge_all();
            self.update(|s| *s = SessionSnapshot::signed_out(Some(err)));
            return;
        }

        tracing::error!(error = %err, "Session state could not be refreshed");
        self.update(|s| {
            if let Some(session) = session {
                let same_user = s
                    .session
                    .as_ref()
                    .is_some_and(|current| current.user_id == session.user_id);
                if !same_user {
                    s.user = None;
                    s.profile = None;
                }
                s.session = Some(session);
            }
            s.status = if s.session.is_some() {
                SessionStatus::Authenticated
            } else {
                SessionStatus::Unauthenticated
            };
            s.last_error = Some(err);
            s.stale = s.session.is_some();
        });
    }

    /// Swap in reissued tokens for the current identity
    async fn replace_session(&self, session: Session) {
        let current_user = self.snapshot().user.map(|u| u.id);
        if current_user == Some(session.user_id) {
            self.update(|s| {
                s.session = Some(session);
                s.status = SessionStatus::Authenticated;
                s.last_error = None;
                s.stale = false;
            });
            return;
        }
        // tokens for someone we have not verified yet
        let _ = self.establish(session).await;
    }

    fn clear(&self) {
        self.forget_current();
        self.profiles.purge_all();
        self.update(|s| *s = SessionSnapshot::signed_out(None));
    }

    fn forget_current(&self) {
        let current = self.state.borrow().session.as_ref().map(|s| s.user_id);
        if let Some(user_id) = current {
            self.validator.anomalies().forget(user_id);
        }
    }

    /// Fetch the provider's current session and adopt it
    async fn load_current(&self) -> Result<(), AuthError> {
        let session = match self.provider.get_session().await {
            Ok(session) => session,
            Err(e) => {
                let e = AuthError::from(e);
                self.degrade(None, e.clone());
                return Err(e);
            }
        };

        let Some(session) = session else {
            self.update(|s| *s = SessionSnapshot::signed_out(None));
            return Ok(());
        };

        match self.validator.verify_client(&session).await {
            Ok(client) => self.adopt(session, client.identity).await,
            Err(AuthError::SessionExpired) => {
                tracing::info!(user_id = %session.user_id, "Stored session expired, refreshing");
                match self.provider.refresh_session().await {
                    Ok(refreshed) => self.establish(refreshed).await,
                    Err(e) => {
                        let e = AuthError::from(e);
                        self.degrade(Some(session), e.clone());
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.degrade(Some(session), e.clone());
                Err(e)
            }
        }
    }

    async fn apply(&self, event: AuthEvent) {
        tracing::debug!(event = event.name(), "Applying auth event");
        match event {
            AuthEvent::SignedIn(session) => {
                let _ = self.establish(session).await;
            }
            AuthEvent::SignedOut => {
                self.clear();
                tracing::info!("Session signed out");
            }
            AuthEvent::TokenRefreshed(session) | AuthEvent::MfaChallengeVerified(session) => {
                self.replace_session(session).await;
            }
            AuthEvent::UserUpdated(session) => {
                self.profiles.invalidate(session.user_id);
                let _ = self.establish(session).await;
            }
        }
    }

    async fn listen(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            if !self.is_alive() {
                break;
            }
            self.apply(event).await;
        }
        tracing::debug!("Auth event listener stopped");
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct SessionManagerBuilder {
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<ProfileCache>,
    validator: Option<Arc<SessionValidator>>,
    failures: Option<RateLimiter>,
}

impl SessionManagerBuilder {
    /// Validator to use instead of a default one over the same provider
    pub fn validator(mut self, validator: Arc<SessionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Refuse password attempts for an email once its failure budget is spent
    pub fn failure_limiter(mut self, limiter: RateLimiter) -> Self {
        self.failures = Some(limiter);
        self
    }

    pub fn build(self) -> SessionManager {
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(SessionValidator::new(Arc::clone(&self.provider))));
        let (state, _) = watch::channel(SessionSnapshot::default());

        SessionManager {
            mfa: MfaEngine::new(Arc::clone(&self.provider)),
            inner: Arc::new(ManagerInner {
                provider: self.provider,
                validator,
                profiles: self.profiles,
                failures: self.failures,
                state,
                alive: AtomicBool::new(true),
            }),
            init_started: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }
}

/// Session lifecycle manager, one per application session
pub struct SessionManager {
    inner: Arc<ManagerInner>,
    mfa: MfaEngine,
    init_started: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, profiles: Arc<ProfileCache>) -> Self {
        Self::builder(provider, profiles).build()
    }

    pub fn builder(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<ProfileCache>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            provider,
            profiles,
            validator: None,
            failures: None,
        }
    }

    /// Load the current session and start listening for provider events.
    ///
    /// Runs once per manager; later calls return immediately, including while
    /// the first one is still in flight.
    pub async fn initialize(&self) -> Result<(), AuthError> {
        if self.init_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // subscribe first so events raised while loading are queued, not lost
        let events = self.inner.provider.subscribe();
        self.inner.update(|s| s.status = SessionStatus::Initializing);

        let outcome = self.inner.load_current().await;

        if self.inner.is_alive() {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(inner.listen(events));
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        match &outcome {
            Ok(()) => tracing::info!(status = ?self.status(), "Session manager initialized"),
            Err(e) => tracing::warn!(error = %e, "Session manager initialized with errors"),
        }
        outcome
    }

    /// Password sign-in. State follows through the `SignedIn` event.
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        options: SignInOptions,
    ) -> Result<(), AuthError> {
        let key = failure_key(email);
        if let Some(limiter) = &self.inner.failures {
            if let Some(retry_after) = limiter.auth_failures_exhausted(&key).await {
                tracing::warn!(retry_after, "Sign-in refused after repeated failures");
                return Err(AuthError::RateLimited { retry_after });
            }
        }

        match self
            .inner
            .provider
            .sign_in_with_password(email, password, options.duration)
            .await
        {
            Ok(session) => {
                if let Some(limiter) = &self.inner.failures {
                    limiter.clear_auth_failures(&key).await;
                }
                tracing::info!(
                    user_id = %session.user_id,
                    duration = ?options.duration,
                    "Password sign-in succeeded"
                );
                Ok(())
            }
            Err(e) => {
                let err = AuthError::from(e);
                if err == AuthError::InvalidCredentials {
                    if let Some(limiter) = &self.inner.failures {
                        limiter.record_auth_failure(&key).await;
                    }
                }
                tracing::warn!(error = %err, "Password sign-in failed");
                Err(err)
            }
        }
    }

    /// Send a one-time sign-in code to `email`
    pub async fn sign_in_with_one_time_code(&self, email: &str) -> Result<(), AuthError> {
        self.inner
            .provider
            .sign_in_with_otp(email)
            .await
            .map_err(|e| {
                let err = AuthError::from(e);
                tracing::warn!(error = %err, "One-time code request failed");
                err
            })
    }

    /// Start an external-provider sign-in and return the URL to redirect to
    pub async fn sign_in_with_external_provider(
        &self,
        provider: &str,
    ) -> Result<String, AuthError> {
        let url = self.inner.provider.sign_in_with_oauth(provider).await?;
        tracing::info!(provider = %provider, "External sign-in started");
        Ok(url)
    }

    /// End the session for `scope`. The profile cache is purged in every case,
    /// and `Local`/`Global` clear local state even when the provider call fails.
    pub async fn sign_out(&self, scope: SignOutScope) -> Result<(), AuthError> {
        let result = self.inner.provider.sign_out(scope).await;
        self.inner.profiles.purge_all();

        match result {
            Ok(()) => {
                if scope.clears_local() {
                    self.inner.clear();
                }
                tracing::info!(scope = scope.as_str(), "Signed out");
                Ok(())
            }
            Err(e) => {
                let err = AuthError::from(e);
                tracing::error!(scope = scope.as_str(), error = %err, "Sign-out failed");
                if scope.clears_local() {
                    // the provider may still hold the session, this device does not
                    self.inner.clear();
                    self.inner.update(|s| s.last_error = Some(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Reissue tokens for the current identity
    pub async fn refresh_session(&self) -> Result<(), AuthError> {
        match self.inner.provider.refresh_session().await {
            Ok(session) => {
                tracing::debug!(user_id = %session.user_id, "Session refreshed");
                Ok(())
            }
            Err(e) => {
                let err = AuthError::from(e);
                tracing::warn!(error = %err, "Session refresh failed");
                self.inner.degrade(None, err.clone());
                Err(err)
            }
        }
    }

    /// Write display fields through to the store, then patch local state
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<UserProfile, AuthError> {
        let user_id = self
            .inner
            .snapshot()
            .user
            .map(|u| u.id)
            .ok_or(AuthError::NotAuthenticated)?;

        let updated = self
            .inner
            .profiles
            .store()
            .update_profile(user_id, &patch)
            .await?;
        self.inner.profiles.invalidate(user_id);
        self.inner.update(|s| {
            if s.user.as_ref().is_some_and(|u| u.id == user_id) {
                s.profile = Some(updated.clone());
            }
        });

        tracing::info!(user_id = %user_id, "Profile updated");
        Ok(updated)
    }

    /// Merge `metadata` into the provider's user record
    pub async fn update_user_metadata(&self, metadata: serde_json::Value) -> Result<(), AuthError> {
        self.inner.provider.update_user(metadata).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Role predicates
    // -------------------------------------------------------------------------

    pub fn has_role(&self, role: UserRole) -> bool {
        self.inner
            .state
            .borrow()
            .active_profile()
            .is_some_and(|p| p.role == role)
    }

    pub fn has_any_role(&self, roles: &[UserRole]) -> bool {
        self.inner
            .state
            .borrow()
            .active_profile()
            .is_some_and(|p| roles.contains(&p.role))
    }

    /// Owners and admins see every area; everyone else only their own
    pub fn can_access_area(&self, area_id: AreaId) -> bool {
        self.inner
            .state
            .borrow()
            .active_profile()
            .is_some_and(|p| p.role.sees_all_areas() || p.area_id == Some(area_id))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.borrow().status
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.borrow().session.clone()
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.inner.state.borrow().user.clone()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.inner.state.borrow().profile.clone()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    /// MFA engine bound to the same provider
    pub fn mfa(&self) -> &MfaEngine {
        &self.mfa
    }

    /// Stop applying results and drop the event subscription
    pub fn shutdown(&self) {
        if self.inner.alive.swap(false, Ordering::SeqCst) {
            tracing::debug!("Session manager shutting down");
        }
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
