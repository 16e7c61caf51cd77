//! Identity provider boundary
//!
//! The identity provider is an opaque remote service. Everything this crate
//! needs from it is expressed by [`IdentityProvider`]; its failures arrive as
//! [`ProviderError`] and are translated into the [`AuthError`] taxonomy by
//! [`map_provider_error`], the only place provider error shapes are inspected.

mod gotrue;
mod memory;

pub use gotrue::GoTrueProvider;
pub use memory::MemoryIdentityProvider;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratix_shared::{
    AssuranceLevel, AssuranceLevels, AuthError, FactorEnrollment, MfaChallenge, MfaFactor,
    Session, SessionDuration, SignOutScope,
};
use tokio::sync::mpsc;

/// Lifecycle events pushed by the provider, delivered in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
    TokenRefreshed(Session),
    UserUpdated(Session),
    MfaChallengeVerified(Session),
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignedIn(_) => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed(_) => "TOKEN_REFRESHED",
            Self::UserUpdated(_) => "USER_UPDATED",
            Self::MfaChallengeVerified(_) => "MFA_CHALLENGE_VERIFIED",
        }
    }
}

/// Receiving half of an event subscription. Dropping it unsubscribes.
pub type EventReceiver = mpsc::UnboundedReceiver<AuthEvent>;

/// Fan-out of provider events to subscribers
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AuthEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones
    pub fn emit(&self, event: AuthEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        tracing::debug!(
            event = event.name(),
            subscribers = subscribers.len(),
            "Auth event emitted"
        );
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// User record as returned by the provider, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed: bool,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub factors: Vec<MfaFactor>,
    /// Assurance level of the session the lookup token belongs to
    #[serde(default)]
    pub aal: Option<AssuranceLevel>,
}

/// Raw provider failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<u64>,
    },
    #[error("No active session")]
    NoSession,
    #[error("Provider transport error: {0}")]
    Transport(String),
    #[error("Malformed provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn api(status: u16, code: &str, message: &str) -> Self {
        Self::Api {
            status,
            code: Some(code.to_string()),
            message: message.to_string(),
            retry_after: None,
        }
    }
}

/// Default back-off when the provider throttles without saying for how long
const DEFAULT_PROVIDER_RETRY_AFTER: u64 = 60;

/// Map a provider failure into the authentication taxonomy
pub fn map_provider_error(err: &ProviderError) -> AuthError {
    let (status, code, message, retry_after) = match err {
        ProviderError::NoSession => return AuthError::NotAuthenticated,
        ProviderError::Transport(_) => return AuthError::ProviderUnavailable,
        ProviderError::Decode(msg) => return AuthError::Unexpected(msg.clone()),
        ProviderError::Api {
            status,
            code,
            message,
            retry_after,
        } => (*status, code.as_deref(), message.as_str(), *retry_after),
    };

    let by_code = code.and_then(|code| match code {
        "invalid_credentials" => Some(AuthError::InvalidCredentials),
        "email_not_confirmed" | "phone_not_confirmed" => Some(AuthError::UnverifiedContact),
        "user_not_found" | "otp_disabled" => Some(AuthError::IdentityNotFound),
        "over_request_rate_limit" | "over_email_send_rate_limit" => Some(AuthError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_PROVIDER_RETRY_AFTER),
        }),
        "session_expired" | "session_not_found" | "refresh_token_not_found"
        | "refresh_token_already_used" | "bad_jwt" => Some(AuthError::SessionExpired),
        "insufficient_aal" => Some(AuthError::InsufficientAssurance {
            required: AssuranceLevel::Aal2,
        }),
        "mfa_verification_failed" => Some(AuthError::InvalidChallengeCode),
        "mfa_challenge_expired" => Some(AuthError::ChallengeExpired),
        "mfa_factor_not_found" => Some(AuthError::UnknownFactor),
        _ => None,
    });
    if let Some(mapped) = by_code {
        return mapped;
    }

    match status {
        429 => AuthError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_PROVIDER_RETRY_AFTER),
        },
        500..=599 => AuthError::ProviderUnavailable,
        401 | 403 => AuthError::SessionExpired,
        404 => AuthError::IdentityNotFound,
        400 if message.contains("Invalid login credentials") => AuthError::InvalidCredentials,
        400 if message.contains("Email not confirmed") => AuthError::UnverifiedContact,
        _ => AuthError::Unexpected(message.to_string()),
    }
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        map_provider_error(&err)
    }
}

/// Operations consumed from the identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current locally held session, if any
    async fn get_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Re-verify `access_token` with the provider and return its owner
    async fn get_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        duration: SessionDuration,
    ) -> Result<Session, ProviderError>;

    /// Send a one-time sign-in code / magic link
    async fn sign_in_with_otp(&self, email: &str) -> Result<(), ProviderError>;

    /// Start an external provider sign-in, returning the redirect URL
    async fn sign_in_with_oauth(&self, provider: &str) -> Result<String, ProviderError>;

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), ProviderError>;

    async fn refresh_session(&self) -> Result<Session, ProviderError>;

    async fn update_user(&self, metadata: serde_json::Value) -> Result<ProviderUser, ProviderError>;

    async fn enroll_factor(&self, friendly_name: &str) -> Result<FactorEnrollment, ProviderError>;

    async fn challenge_factor(&self, factor_id: &str) -> Result<MfaChallenge, ProviderError>;

    async fn verify_factor(
        &self,
        factor_id: &str,
        challenge_id: &str,
        code: &str,
    ) -> Result<Session, ProviderError>;

    async fn list_factors(&self) -> Result<Vec<MfaFactor>, ProviderError>;

    async fn unenroll_factor(&self, factor_id: &str) -> Result<(), ProviderError>;

    async fn get_assurance_level(&self) -> Result<AssuranceLevels, ProviderError>;

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> EventReceiver;
}
