//! In-process identity provider
//!
//! Behaves like the remote provider for development without one: issues
//! opaque tokens, verifies real TOTP codes and pushes lifecycle events. Fault
//! injection (`set_unavailable`, `revoke_token`) and call counters make it the
//! provider used throughout the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use stratix_shared::{
    AssuranceLevel, AssuranceLevels, FactorEnrollment, FactorStatus, FactorType, MfaChallenge,
    MfaFactor, Session, SessionDuration, SignOutScope, UserId,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{AuthEvent, EventHub, EventReceiver, IdentityProvider, ProviderError, ProviderUser};
use crate::totp;

const DEFAULT_SESSION_TTL: Duration = Duration::hours(1);
const DEFAULT_CHALLENGE_TTL: Duration = Duration::minutes(5);

struct MemoryFactor {
    factor: MfaFactor,
    secret: String,
}

struct MemoryUser {
    id: UserId,
    email: String,
    password: String,
    email_confirmed: bool,
    metadata: serde_json::Value,
    factors: Vec<MemoryFactor>,
}

impl MemoryUser {
    fn to_provider_user(&self, aal: Option<AssuranceLevel>) -> ProviderUser {
        ProviderUser {
            id: self.id.to_string(),
            email: Some(self.email.clone()),
            email_confirmed: self.email_confirmed,
            user_metadata: self.metadata.clone(),
            factors: self.factors.iter().map(|f| f.factor.clone()).collect(),
            aal,
        }
    }

    fn has_verified_factor(&self) -> bool {
        self.factors.iter().any(|f| f.factor.is_verified())
    }
}

struct TokenRecord {
    user_id: UserId,
    aal: AssuranceLevel,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, MemoryUser>,
    by_email: HashMap<String, UserId>,
    access_tokens: HashMap<String, TokenRecord>,
    refresh_tokens: HashMap<String, String>,
    challenges: HashMap<String, MfaChallenge>,
    current: Option<Session>,
    otp_requests: Vec<String>,
}

impl MemoryState {
    fn current(&self) -> Result<&Session, ProviderError> {
        self.current.as_ref().ok_or(ProviderError::NoSession)
    }

    fn current_user_mut(&mut self) -> Result<&mut MemoryUser, ProviderError> {
        let user_id = self.current()?.user_id;
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| ProviderError::api(404, "user_not_found", "User not found"))
    }

    fn current_aal(&self) -> Result<AssuranceLevel, ProviderError> {
        let session = self.current()?;
        self.access_tokens
            .get(&session.access_token)
            .map(|record| record.aal)
            .ok_or_else(|| ProviderError::api(401, "session_not_found", "Session not found"))
    }

    fn drop_tokens(&mut self, access_token: &str) {
        self.access_tokens.remove(access_token);
        self.refresh_tokens.retain(|_, access| access != access_token);
    }
}

/// Identity provider backed by process memory
pub struct MemoryIdentityProvider {
    state: Mutex<MemoryState>,
    events: EventHub,
    unavailable: AtomicBool,
    session_ttl: Duration,
    challenge_ttl: Duration,
    get_user_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            events: EventHub::new(),
            unavailable: AtomicBool::new(false),
            session_ttl: DEFAULT_SESSION_TTL,
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            get_user_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport(
                "identity provider unreachable".to_string(),
            ));
        }
        Ok(())
    }

    /// Register a confirmed user
    pub fn add_user(&self, email: &str, password: &str) -> UserId {
        self.insert_user(email, password, true)
    }

    /// Register a user whose email has not been confirmed
    pub fn add_unconfirmed_user(&self, email: &str, password: &str) -> UserId {
        self.insert_user(email, password, false)
    }

    fn insert_user(&self, email: &str, password: &str, email_confirmed: bool) -> UserId {
        let id = UserId::new();
        let email = email.trim().to_lowercase();
        let mut state = self.lock();
        state.by_email.insert(email.clone(), id);
        state.users.insert(
            id,
            MemoryUser {
                id,
                email,
                password: password.to_string(),
                email_confirmed,
                metadata: serde_json::json!({}),
                factors: Vec::new(),
            },
        );
        id
    }

    /// Simulate the provider going offline (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Invalidate an access token provider-side
    pub fn revoke_token(&self, access_token: &str) {
        self.lock().drop_tokens(access_token);
    }

    /// Number of `get_user` round-trips served
    pub fn get_user_calls(&self) -> usize {
        self.get_user_calls.load(Ordering::SeqCst)
    }

    /// Number of `verify_factor` round-trips served
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// Emails that requested a one-time code
    pub fn otp_requests(&self) -> Vec<String> {
        self.lock().otp_requests.clone()
    }

    /// Current TOTP code for an enrolled factor
    pub fn current_code(&self, factor_id: &str) -> Option<String> {
        let state = self.lock();
        state.users.values().find_map(|user| {
            user.factors
                .iter()
                .find(|f| f.factor.id == factor_id)
                .and_then(|f| totp::generate_current_code(&f.secret, &user.email).ok())
        })
    }

    /// Push an event as if it came from another tab or device
    pub fn emit(&self, event: AuthEvent) {
        self.events.emit(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    fn issue_session(
        &self,
        state: &mut MemoryState,
        user_id: UserId,
        aal: AssuranceLevel,
        duration: SessionDuration,
        issued_at: OffsetDateTime,
    ) -> Session {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            access_token: totp::generate_token(),
            refresh_token: totp::generate_token(),
            expires_at: now + self.session_ttl,
            issued_at,
            user_id,
            duration,
        };
        state
            .access_tokens
            .insert(session.access_token.clone(), TokenRecord { user_id, aal });
        state
            .refresh_tokens
            .insert(session.refresh_token.clone(), session.access_token.clone());
        state.current = Some(session.clone());
        session
    }

    /// Replace the current session's tokens, keeping its identity and lifetime
    fn reissue_current(
        &self,
        state: &mut MemoryState,
        aal: AssuranceLevel,
    ) -> Result<Session, ProviderError> {
        let previous = state.current()?.clone();
        state.drop_tokens(&previous.access_token);
        Ok(self.issue_session(
            state,
            previous.user_id,
            aal,
            previous.duration,
            previous.issued_at,
        ))
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        Ok(self.lock().current.clone())
    }

    async fn get_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError> {
        self.ensure_available()?;
        self.get_user_calls.fetch_add(1, Ordering::SeqCst);

        let state = self.lock();
        let record = state
            .access_tokens
            .get(access_token)
            .ok_or_else(|| ProviderError::api(401, "bad_jwt", "invalid JWT"))?;
        let user = state
            .users
            .get(&record.user_id)
            .ok_or_else(|| ProviderError::api(404, "user_not_found", "User not found"))?;
        Ok(user.to_provider_user(Some(record.aal)))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        duration: SessionDuration,
    ) -> Result<Session, ProviderError> {
        self.ensure_available()?;

        let session = {
            let mut state = self.lock();
            let invalid =
                || ProviderError::api(400, "invalid_credentials", "Invalid login credentials");
            let user_id = *state
                .by_email
                .get(&email.trim().to_lowercase())
                .ok_or_else(invalid)?;
            let user = state.users.get(&user_id).ok_or_else(invalid)?;
            if user.password != password {
                return Err(invalid());
            }
            if !user.email_confirmed {
                return Err(ProviderError::api(
                    400,
                    "email_not_confirmed",
                    "Email not confirmed",
                ));
            }
            self.issue_session(
                &mut state,
                user_id,
                AssuranceLevel::Aal1,
                duration,
                OffsetDateTime::now_utc(),
            )
        };

        self.events.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str) -> Result<(), ProviderError> {
        self.ensure_available()?;

        let email = email.trim().to_lowercase();
        let mut state = self.lock();
        if !state.by_email.contains_key(&email) {
            return Err(ProviderError::api(
                422,
                "otp_disabled",
                "Signups not allowed for otp",
            ));
        }
        state.otp_requests.push(email);
        Ok(())
    }

    async fn sign_in_with_oauth(&self, provider: &str) -> Result<String, ProviderError> {
        if provider.trim().is_empty() {
            return Err(ProviderError::api(
                400,
                "validation_failed",
                "Unsupported provider",
            ));
        }
        Ok(format!("memory://authorize?provider={}", provider))
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), ProviderError> {
        self.ensure_available()?;

        {
            let mut state = self.lock();
            let current = state.current()?.clone();
            let owner = current.user_id;
            let others: Vec<String> = state
                .access_tokens
                .iter()
                .filter(|(token, record)| {
                    record.user_id == owner && **token != current.access_token
                })
                .map(|(token, _)| token.clone())
                .collect();

            match scope {
                SignOutScope::Local => state.drop_tokens(&current.access_token),
                SignOutScope::Others => others.iter().for_each(|t| state.drop_tokens(t)),
                SignOutScope::Global => {
                    others.iter().for_each(|t| state.drop_tokens(t));
                    state.drop_tokens(&current.access_token);
                }
            }
            if scope.clears_local() {
                state.current = None;
            }
        }

        if scope.clears_local() {
            self.events.emit(AuthEvent::SignedOut);
        }
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, ProviderError> {
        self.ensure_available()?;

        let session = {
            let mut state = self.lock();
            let current = state.current()?.clone();
            if !state.refresh_tokens.contains_key(&current.refresh_token) {
                return Err(ProviderError::api(
                    401,
                    "refresh_token_not_found",
                    "Invalid Refresh Token",
                ));
            }
            if current.exceeds_lifetime_at(OffsetDateTime::now_utc()) {
                state.drop_tokens(&current.access_token);
                state.current = None;
                return Err(ProviderError::api(401, "session_expired", "Session expired"));
            }
            let aal = state.current_aal()?;
            self.reissue_current(&mut state, aal)?
        };

        self.events.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn update_user(
        &self,
        metadata: serde_json::Value,
    ) -> Result<ProviderUser, ProviderError> {
        self.ensure_available()?;

        let (user, session) = {
            let mut state = self.lock();
            let session = state.current()?.clone();
            let aal = state.current_aal()?;
            let user = state.current_user_mut()?;
            user.metadata = match (user.metadata.take(), metadata) {
                (serde_json::Value::Object(mut existing), serde_json::Value::Object(patch)) => {
                    existing.extend(patch);
                    serde_json::Value::Object(existing)
                }
                (_, replacement) => replacement,
            };
            (user.to_provider_user(Some(aal)), session)
        };

        self.events.emit(AuthEvent::UserUpdated(session));
        Ok(user)
    }

    async fn enroll_factor(&self, friendly_name: &str) -> Result<FactorEnrollment, ProviderError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let user = state.current_user_mut()?;

        let secret = totp::generate_secret();
        let uri = totp::get_otpauth_uri(&secret, &user.email)
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let qr_code = totp::generate_qr_code(&secret, &user.email)
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let factor = MfaFactor {
            id: Uuid::new_v4().to_string(),
            factor_type: FactorType::Totp,
            status: FactorStatus::Unverified,
            friendly_name: Some(friendly_name.to_string()),
        };
        user.factors.push(MemoryFactor {
            factor: factor.clone(),
            secret: secret.clone(),
        });

        Ok(FactorEnrollment {
            factor,
            secret,
            uri,
            qr_code,
        })
    }

    async fn challenge_factor(&self, factor_id: &str) -> Result<MfaChallenge, ProviderError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let user = state.current_user_mut()?;
        if !user.factors.iter().any(|f| f.factor.id == factor_id) {
            return Err(ProviderError::api(
                404,
                "mfa_factor_not_found",
                "Factor not found",
            ));
        }

        let challenge = MfaChallenge {
            id: Uuid::new_v4().to_string(),
            factor_id: factor_id.to_string(),
            expires_at: OffsetDateTime::now_utc() + self.challenge_ttl,
        };
        state
            .challenges
            .insert(challenge.id.clone(), challenge.clone());
        Ok(challenge)
    }

    async fn verify_factor(
        &self,
        factor_id: &str,
        challenge_id: &str,
        code: &str,
    ) -> Result<Session, ProviderError> {
        self.ensure_available()?;
        self.verify_calls.fetch_add(1, Ordering::SeqCst);

        let session = {
            let mut state = self.lock();
            // single use: the challenge is spent whatever the outcome
            let challenge = state.challenges.remove(challenge_id).ok_or_else(|| {
                ProviderError::api(422, "mfa_challenge_expired", "Challenge not found")
            })?;
            if challenge.factor_id != factor_id {
                return Err(ProviderError::api(
                    422,
                    "mfa_factor_not_found",
                    "Challenge was issued for a different factor",
                ));
            }
            if challenge.is_expired_at(OffsetDateTime::now_utc()) {
                return Err(ProviderError::api(
                    422,
                    "mfa_challenge_expired",
                    "Challenge expired",
                ));
            }

            let user = state.current_user_mut()?;
            let account = user.email.clone();
            let factor = user
                .factors
                .iter_mut()
                .find(|f| f.factor.id == factor_id)
                .ok_or_else(|| {
                    ProviderError::api(404, "mfa_factor_not_found", "Factor not found")
                })?;
            let valid = totp::verify_code(&factor.secret, code, &account)
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            if !valid {
                return Err(ProviderError::api(
                    422,
                    "mfa_verification_failed",
                    "Invalid TOTP code entered",
                ));
            }
            factor.factor.status = FactorStatus::Verified;

            self.reissue_current(&mut state, AssuranceLevel::Aal2)?
        };

        self.events
            .emit(AuthEvent::MfaChallengeVerified(session.clone()));
        Ok(session)
    }

    async fn list_factors(&self) -> Result<Vec<MfaFactor>, ProviderError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let user = state.current_user_mut()?;
        Ok(user.factors.iter().map(|f| f.factor.clone()).collect())
    }

    async fn unenroll_factor(&self, factor_id: &str) -> Result<(), ProviderError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let user = state.current_user_mut()?;
        let before = user.factors.len();
        user.factors.retain(|f| f.factor.id != factor_id);
        if user.factors.len() == before {
            return Err(ProviderError::api(
                404,
                "mfa_factor_not_found",
                "Factor not found",
            ));
        }
        state.challenges.retain(|_, c| c.factor_id != factor_id);
        Ok(())
    }

    async fn get_assurance_level(&self) -> Result<AssuranceLevels, ProviderError> {
        self.ensure_available()?;

        let mut state = self.lock();
        let current = state.current_aal()?;
        let next = if state.current_user_mut()?.has_verified_factor() {
            AssuranceLevel::Aal2
        } else {
            AssuranceLevel::Aal1
        };
        Ok(AssuranceLevels::new(current, next.max(current)))
    }

    fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }
}
