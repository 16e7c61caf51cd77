//! Session validation
//!
//! Two deliberately asymmetric paths:
//!
//! - [`SessionValidator::verify_server`] re-verifies a bearer token with the
//!   identity provider and yields a [`VerifiedIdentity`]. It is the only way
//!   to obtain one; server-side authorization must go through it.
//! - [`SessionValidator::verify_client`] checks a locally held [`Session`],
//!   failing fast on expiry, and yields a [`ClientIdentity`], which carries no
//!   authority on the server.
//!
//! Both paths consult the suspicious-identity deny-list. The server path also
//! feeds the anomaly detector, which only logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use regex::Regex;
use stratix_shared::{AssuranceLevel, AuthError, Session, UserId, UserIdentity};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::jwt::{JwtError, TokenVerifier};
use crate::provider::{map_provider_error, IdentityProvider, ProviderUser};

/// Request attributes the anomaly detector compares across requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

impl RequestContext {
    pub fn new(user_agent: Option<&str>, origin: Option<&str>) -> Self {
        Self {
            user_agent: user_agent.map(str::to_string),
            origin: origin.map(str::to_string),
        }
    }
}

/// Identity confirmed by a provider round-trip on the server path
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    identity: UserIdentity,
    assurance: AssuranceLevel,
}

impl VerifiedIdentity {
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.id
    }

    pub fn email(&self) -> &str {
        &self.identity.email
    }

    /// Assurance level of the presented token
    pub fn assurance_level(&self) -> AssuranceLevel {
        self.assurance
    }

    pub fn into_identity(self) -> UserIdentity {
        self.identity
    }
}

/// Identity derived on the client path. Good for display and local state,
/// never for server-side authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIdentity {
    pub identity: UserIdentity,
    pub assurance: Option<AssuranceLevel>,
}

/// Why the server path refused a token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("No session presented")]
    NoSession,
    #[error("Provider returned an identity in an unexpected format")]
    InvalidIdentityFormat,
    #[error("Provider rejected the session: {0}")]
    ProviderRejected(AuthError),
    #[error("Identity is denied")]
    Denied,
}

impl From<ValidationFailure> for AuthError {
    fn from(failure: ValidationFailure) -> Self {
        match failure {
            ValidationFailure::ProviderRejected(err) => err,
            ValidationFailure::NoSession
            | ValidationFailure::InvalidIdentityFormat
            | ValidationFailure::Denied => AuthError::NotAuthenticated,
        }
    }
}

static EMAIL_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(email))
}

fn parse_identity(user: ProviderUser) -> Result<UserIdentity, ValidationFailure> {
    let id: UserId = user
        .id
        .parse()
        .map_err(|_| ValidationFailure::InvalidIdentityFormat)?;
    let email = user
        .email
        .filter(|email| is_valid_email(email))
        .ok_or(ValidationFailure::InvalidIdentityFormat)?;

    Ok(UserIdentity {
        id,
        email,
        metadata: user.user_metadata,
    })
}

// =============================================================================
// Anomaly Detection
// =============================================================================

/// A change in request attributes for an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    UserAgentChanged {
        previous: Option<String>,
        current: Option<String>,
    },
    OriginChanged {
        previous: Option<String>,
        current: Option<String>,
    },
}

struct LastSeen {
    ctx: RequestContext,
    at: Instant,
}

/// Remembers the last user agent and origin seen per identity. Entries idle
/// longer than the sweep's `max_idle` are dropped by [`AnomalyDetector::prune`].
#[derive(Default)]
pub struct AnomalyDetector {
    last_seen: Mutex<HashMap<UserId, LastSeen>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, LastSeen>> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `ctx` for `user_id` and report how it differs from last time.
    /// The first observation of an identity never reports anything.
    pub fn observe(&self, user_id: UserId, ctx: &RequestContext) -> Vec<Anomaly> {
        let previous = self.lock().insert(
            user_id,
            LastSeen {
                ctx: ctx.clone(),
                at: Instant::now(),
            },
        );
        let Some(LastSeen { ctx: previous, .. }) = previous else {
            return Vec::new();
        };

        let mut anomalies = Vec::new();
        if previous.user_agent != ctx.user_agent {
            anomalies.push(Anomaly::UserAgentChanged {
                previous: previous.user_agent,
                current: ctx.user_agent.clone(),
            });
        }
        if previous.origin != ctx.origin {
            anomalies.push(Anomaly::OriginChanged {
                previous: previous.origin,
                current: ctx.origin.clone(),
            });
        }

        for anomaly in &anomalies {
            tracing::warn!(user_id = %user_id, anomaly = ?anomaly, "Session anomaly detected");
        }
        anomalies
    }

    /// Drop what is remembered about `user_id` (on sign-out)
    pub fn forget(&self, user_id: UserId) {
        self.lock().remove(&user_id);
    }

    /// Drop identities not observed within `max_idle`
    pub fn prune(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut last_seen = self.lock();
        let before = last_seen.len();
        last_seen.retain(|_, seen| now.duration_since(seen.at) < max_idle);
        before - last_seen.len()
    }

    /// Number of identities currently remembered
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

// =============================================================================
// Validator
// =============================================================================

pub struct SessionValidator {
    provider: Arc<dyn IdentityProvider>,
    tokens: TokenVerifier,
    deny_list: Vec<Regex>,
    anomalies: AnomalyDetector,
}

impl SessionValidator {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            tokens: TokenVerifier::unsigned(),
            deny_list: Vec::new(),
            anomalies: AnomalyDetector::new(),
        }
    }

    /// Check token signatures locally before the provider round-trip
    pub fn with_token_verifier(mut self, tokens: TokenVerifier) -> Self {
        self.tokens = tokens;
        self
    }

    /// Hard-reject identities whose email matches any of `patterns`
    pub fn with_deny_list<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self, regex::Error> {
        self.deny_list = patterns
            .iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn anomalies(&self) -> &AnomalyDetector {
        &self.anomalies
    }

    /// Prune idle anomaly entries every `interval` until the handle is aborted
    pub fn spawn_anomaly_sweep(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = validator.anomalies.prune(max_idle);
                if removed > 0 {
                    tracing::debug!(removed, "Swept idle anomaly entries");
                }
            }
        })
    }

    pub fn is_denied(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.deny_list.iter().any(|re| re.is_match(&email))
    }

    /// Server-trusted verification: always a provider round-trip
    pub async fn verify_server(
        &self,
        token: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<VerifiedIdentity, ValidationFailure> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ValidationFailure::NoSession)?;

        let claims = self.tokens.validate(token).map_err(|e| {
            tracing::warn!(error = %e, "Bearer token failed local validation");
            ValidationFailure::ProviderRejected(match e {
                JwtError::Expired => AuthError::SessionExpired,
                JwtError::Invalid | JwtError::Validation(_) => AuthError::NotAuthenticated,
            })
        })?;

        let user = self.provider.get_user(token).await.map_err(|e| {
            let mapped = map_provider_error(&e);
            tracing::warn!(error = %e, mapped = %mapped, "Provider rejected bearer token");
            ValidationFailure::ProviderRejected(mapped)
        })?;
        let token_aal = user.aal;
        let identity = parse_identity(user)?;

        if let Some(claims) = &claims {
            if claims.sub != identity.id.to_string() {
                tracing::warn!(
                    user_id = %identity.id,
                    sub = %claims.sub,
                    "Token subject does not match provider identity"
                );
                return Err(ValidationFailure::InvalidIdentityFormat);
            }
        }

        if self.is_denied(&identity.email) {
            tracing::warn!(user_id = %identity.id, "Denied identity presented a valid session");
            return Err(ValidationFailure::Denied);
        }

        self.anomalies.observe(identity.id, ctx);

        let assurance = token_aal
            .or_else(|| claims.as_ref().and_then(|c| c.assurance_level()))
            .unwrap_or(AssuranceLevel::Aal1);

        Ok(VerifiedIdentity {
            identity,
            assurance,
        })
    }

    /// Client-convenience verification of a locally held session
    pub async fn verify_client(&self, session: &Session) -> Result<ClientIdentity, AuthError> {
        if session.is_expired() {
            tracing::debug!(user_id = %session.user_id, "Local session expired");
            return Err(AuthError::SessionExpired);
        }

        let user = self.provider.get_user(&session.access_token).await?;
        let assurance = user.aal;
        let identity = parse_identity(user).map_err(AuthError::from)?;

        if identity.id != session.user_id {
            tracing::warn!(
                user_id = %identity.id,
                session_user_id = %session.user_id,
                "Session owner does not match provider identity"
            );
            return Err(AuthError::NotAuthenticated);
        }
        if self.is_denied(&identity.email) {
            tracing::warn!(user_id = %identity.id, "Denied identity holds a local session");
            return Err(AuthError::NotAuthenticated);
        }

        Ok(ClientIdentity {
            identity,
            assurance,
        })
    }
}
