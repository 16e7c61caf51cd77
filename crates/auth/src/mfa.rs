//! MFA trust engine
//!
//! TOTP enrollment, challenge and verification on top of the identity
//! provider, plus the assurance-level gate every sensitive operation goes
//! through.
//!
//! Challenges issued through the engine are tracked in a local ledger. Only a
//! challenge in the ledger can be verified, against its own factor, before
//! expiry and at most once. Attempts bound to fail never reach the provider.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stratix_shared::{
    AssuranceLevel, AssuranceLevels, AuthError, FactorEnrollment, MfaChallenge, MfaFactor, Session,
};
use time::OffsetDateTime;

use crate::provider::IdentityProvider;
use crate::totp;

const DEFAULT_FACTOR_LABEL: &str = "Authenticator";

/// Why the trust gate refused to run an operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustGateRefusal {
    /// No usable session; the caller needs a full sign-in
    #[error("Authentication required")]
    NotAuthenticated,

    /// Signed in, but below the required level
    #[error("Assurance level {required} required, session is at {current}")]
    InsufficientAssurance {
        required: AssuranceLevel,
        current: AssuranceLevel,
        /// Completing an already enrolled factor would satisfy the gate
        mfa_would_resolve: bool,
    },

    /// The assurance level could not be determined
    #[error("Assurance check failed: {0}")]
    Unavailable(AuthError),
}

impl From<TrustGateRefusal> for AuthError {
    fn from(refusal: TrustGateRefusal) -> Self {
        match refusal {
            TrustGateRefusal::NotAuthenticated => AuthError::NotAuthenticated,
            TrustGateRefusal::InsufficientAssurance { required, .. } => {
                AuthError::InsufficientAssurance { required }
            }
            TrustGateRefusal::Unavailable(err) => err,
        }
    }
}

pub struct MfaEngine {
    provider: Arc<dyn IdentityProvider>,
    ledger: Mutex<HashMap<String, MfaChallenge>>,
}

impl MfaEngine {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<String, MfaChallenge>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new TOTP factor. It starts unverified.
    pub async fn enroll(&self, label: &str) -> Result<FactorEnrollment, AuthError> {
        let label = match label.trim() {
            "" => DEFAULT_FACTOR_LABEL,
            trimmed => trimmed,
        };
        let enrollment = self.provider.enroll_factor(label).await?;

        tracing::info!(
            factor_id = %enrollment.factor.id,
            label = %label,
            "TOTP factor enrolled"
        );
        Ok(enrollment)
    }

    /// Issue a short-lived challenge for an enrolled factor
    pub async fn challenge(&self, factor_id: &str) -> Result<MfaChallenge, AuthError> {
        let challenge = self.provider.challenge_factor(factor_id).await?;

        let now = OffsetDateTime::now_utc();
        let mut ledger = self.ledger();
        ledger.retain(|_, c| !c.is_expired_at(now));
        ledger.insert(challenge.id.clone(), challenge.clone());

        tracing::debug!(
            factor_id = %factor_id,
            challenge_id = %challenge.id,
            "MFA challenge issued"
        );
        Ok(challenge)
    }

    /// Verify `code` against a challenge. On success the factor is verified
    /// and the returned session carries the raised assurance level.
    pub async fn verify(
        &self,
        factor_id: &str,
        challenge_id: &str,
        code: &str,
    ) -> Result<Session, AuthError> {
        if !totp::is_well_formed_code(code) {
            tracing::warn!(factor_id = %factor_id, "Rejected malformed verification code");
            return Err(AuthError::MalformedChallengeCode);
        }

        // consumed whatever the outcome
        let challenge = self.ledger().remove(challenge_id).ok_or_else(|| {
            tracing::warn!(challenge_id = %challenge_id, "No live challenge to verify against");
            AuthError::ChallengeExpired
        })?;
        if challenge.factor_id != factor_id {
            tracing::warn!(
                factor_id = %factor_id,
                challenge_id = %challenge_id,
                "Challenge presented for a different factor"
            );
            return Err(AuthError::UnknownFactor);
        }
        if challenge.is_expired_at(OffsetDateTime::now_utc()) {
            tracing::warn!(challenge_id = %challenge_id, "Challenge expired before verification");
            return Err(AuthError::ChallengeExpired);
        }

        match self
            .provider
            .verify_factor(factor_id, challenge_id, code)
            .await
        {
            Ok(session) => {
                tracing::info!(
                    user_id = %session.user_id,
                    factor_id = %factor_id,
                    "MFA verification succeeded"
                );
                Ok(session)
            }
            Err(e) => {
                let mapped = AuthError::from(e);
                tracing::warn!(factor_id = %factor_id, error = %mapped, "MFA verification failed");
                Err(mapped)
            }
        }
    }

    pub async fn list_factors(&self) -> Result<Vec<MfaFactor>, AuthError> {
        Ok(self.provider.list_factors().await?)
    }

    pub async fn unenroll(&self, factor_id: &str) -> Result<(), AuthError> {
        self.provider.unenroll_factor(factor_id).await?;
        self.ledger().retain(|_, c| c.factor_id != factor_id);

        tracing::info!(factor_id = %factor_id, "TOTP factor removed");
        Ok(())
    }

    pub async fn get_assurance_level(&self) -> Result<AssuranceLevels, AuthError> {
        Ok(self.provider.get_assurance_level().await?)
    }

    /// True exactly when a verified factor exists but this session has not used it
    pub async fn requires_mfa(&self) -> Result<bool, AuthError> {
        Ok(self.get_assurance_level().await?.requires_mfa())
    }

    pub async fn has_required_aal(&self, required: AssuranceLevel) -> Result<bool, AuthError> {
        Ok(self.get_assurance_level().await?.current.satisfies(required))
    }

    /// Run `operation` only if the session meets `required`.
    ///
    /// A refusal never runs the operation. Sensitive actions normally pass
    /// `AssuranceLevel::Aal2`.
    pub async fn with_trust_gate<T, F, Fut>(
        &self,
        required: AssuranceLevel,
        operation: F,
    ) -> Result<T, TrustGateRefusal>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let levels = match self.provider.get_assurance_level().await {
            Ok(levels) => levels,
            Err(e) => {
                return Err(match AuthError::from(e) {
                    AuthError::NotAuthenticated | AuthError::SessionExpired => {
                        TrustGateRefusal::NotAuthenticated
                    }
                    other => TrustGateRefusal::Unavailable(other),
                })
            }
        };

        if !levels.current.satisfies(required) {
            let mfa_would_resolve = levels.next.satisfies(required);
            tracing::warn!(
                required = %required,
                current = %levels.current,
                mfa_would_resolve,
                "Trust gate refused operation"
            );
            return Err(TrustGateRefusal::InsufficientAssurance {
                required,
                current: levels.current,
                mfa_would_resolve,
            });
        }

        Ok(operation().await)
    }

    /// Seconds left in the current TOTP window, for countdown display
    pub fn time_remaining_in_window(&self) -> u64 {
        let now = u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or(0);
        totp::time_remaining_in_window(now)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::MemoryIdentityProvider;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stratix_shared::{SessionDuration, SignOutScope};

    async fn signed_in(
        provider: MemoryIdentityProvider,
    ) -> (Arc<MemoryIdentityProvider>, MfaEngine) {
        let provider = Arc::new(provider);
        provider.add_user("ana@acme.io", "pw");
        provider
            .sign_in_with_password("ana@acme.io", "pw", SessionDuration::Standard)
            .await
            .unwrap();
        let engine = MfaEngine::new(provider.clone());
        (provider, engine)
    }

    async fn enroll_and_verify(provider: &MemoryIdentityProvider, engine: &MfaEngine) -> String {
        let factor_id = engine.enroll("phone").await.unwrap().factor.id;
        let challenge = engine.challenge(&factor_id).await.unwrap();
        let code = provider.current_code(&factor_id).unwrap();
        engine.verify(&factor_id, &challenge.id, &code).await.unwrap();
        factor_id
    }

    #[tokio::test]
    async fn test_enroll_challenge_verify() {
        let (provider, engine) = signed_in(MemoryIdentityProvider::new()).await;

        let enrollment = engine.enroll("  ").await.unwrap();
        assert!(!enrollment.factor.is_verified());
        assert_eq!(enrollment.factor.friendly_name.as_deref(), Some("Authenticator"));
        assert!(enrollment.qr_code.starts_with("data:image/png;base64,"));
        assert!(!engine.has_required_aal(AssuranceLevel::Aal2).await.unwrap());

        let factor_id = enrollment.factor.id;
        let challenge = engine.challenge(&factor_id).await.unwrap();
        let code = provider.current_code(&factor_id).unwrap();
        let session = engine.verify(&factor_id, &challenge.id, &code).await.unwrap();

        assert_eq!(provider.get_session().await.unwrap(), Some(session));
        assert!(engine.list_factors().await.unwrap()[0].is_verified());
        assert!(!engine.requires_mfa().await.unwrap());
        assert!(engine.has_required_aal(AssuranceLevel::Aal2).await.unwrap());
        assert!(engine.has_required_aal(AssuranceLevel::Aal1).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_code_never_reaches_provider() {
        let (provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        let factor_id = engine.enroll("phone").await.unwrap().factor.id;
        let challenge = engine.challenge(&factor_id).await.unwrap();

        for code in ["12345", "1234567", "12a456", "", " 123456", "١٢٣٤٥٦"] {
            assert_eq!(
                engine.verify(&factor_id, &challenge.id, code).await.unwrap_err(),
                AuthError::MalformedChallengeCode
            );
        }
        assert_eq!(provider.verify_calls(), 0);

        // the challenge was not spent
        let code = provider.current_code(&factor_id).unwrap();
        assert!(engine.verify(&factor_id, &challenge.id, &code).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_challenge_leaves_factor_unverified() {
        let (provider, engine) = signed_in(
            MemoryIdentityProvider::new().with_challenge_ttl(time::Duration::seconds(-1)),
        )
        .await;
        let factor_id = engine.enroll("phone").await.unwrap().factor.id;
        let challenge = engine.challenge(&factor_id).await.unwrap();
        let code = provider.current_code(&factor_id).unwrap();

        assert_eq!(
            engine.verify(&factor_id, &challenge.id, &code).await.unwrap_err(),
            AuthError::ChallengeExpired
        );
        assert_eq!(provider.verify_calls(), 0);
        assert!(!engine.list_factors().await.unwrap()[0].is_verified());
    }

    #[tokio::test]
    async fn test_challenge_bound_to_its_factor() {
        let (provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        let first = engine.enroll("phone").await.unwrap().factor.id;
        let second = engine.enroll("tablet").await.unwrap().factor.id;
        let challenge = engine.challenge(&first).await.unwrap();
        let code = provider.current_code(&second).unwrap();

        assert_eq!(
            engine.verify(&second, &challenge.id, &code).await.unwrap_err(),
            AuthError::UnknownFactor
        );
        // and spent by the attempt
        let code = provider.current_code(&first).unwrap();
        assert_eq!(
            engine.verify(&first, &challenge.id, &code).await.unwrap_err(),
            AuthError::ChallengeExpired
        );
        assert_eq!(provider.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_factor_challenge() {
        let (_provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        assert_eq!(
            engine.challenge("no-such-factor").await.unwrap_err(),
            AuthError::UnknownFactor
        );
    }

    #[tokio::test]
    async fn test_trust_gate_refuses_below_required_level() {
        let (provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        enroll_and_verify(&provider, &engine).await;

        // a fresh sign-in starts back at aal1
        provider.sign_out(SignOutScope::Local).await.unwrap();
        provider
            .sign_in_with_password("ana@acme.io", "pw", SessionDuration::Standard)
            .await
            .unwrap();
        assert!(engine.requires_mfa().await.unwrap());

        let invoked = AtomicBool::new(false);
        let refusal = engine
            .with_trust_gate(AssuranceLevel::Aal2, || async {
                invoked.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(
            refusal,
            TrustGateRefusal::InsufficientAssurance {
                required: AssuranceLevel::Aal2,
                current: AssuranceLevel::Aal1,
                mfa_would_resolve: true,
            }
        );
        assert_eq!(
            AuthError::from(refusal),
            AuthError::InsufficientAssurance {
                required: AssuranceLevel::Aal2
            }
        );
    }

    #[tokio::test]
    async fn test_trust_gate_without_enrolled_factor() {
        let (_provider, engine) = signed_in(MemoryIdentityProvider::new()).await;

        let refusal = engine
            .with_trust_gate(AssuranceLevel::Aal2, || async { "exported" })
            .await
            .unwrap_err();
        assert!(matches!(
            refusal,
            TrustGateRefusal::InsufficientAssurance {
                mfa_would_resolve: false,
                ..
            }
        ));

        let allowed = engine
            .with_trust_gate(AssuranceLevel::Aal1, || async { "listed" })
            .await
            .unwrap();
        assert_eq!(allowed, "listed");
    }

    #[tokio::test]
    async fn test_trust_gate_passes_at_aal2() {
        let (provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        enroll_and_verify(&provider, &engine).await;

        let result = engine
            .with_trust_gate(AssuranceLevel::Aal2, || async { 42 })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_trust_gate_distinguishes_signed_out() {
        let provider = Arc::new(MemoryIdentityProvider::new());
        let engine = MfaEngine::new(provider);

        let refusal = engine
            .with_trust_gate(AssuranceLevel::Aal2, || async {})
            .await
            .unwrap_err();
        assert_eq!(refusal, TrustGateRefusal::NotAuthenticated);
    }

    #[tokio::test]
    async fn test_unenroll() {
        let (_provider, engine) = signed_in(MemoryIdentityProvider::new()).await;
        let factor_id = engine.enroll("phone").await.unwrap().factor.id;

        engine.unenroll(&factor_id).await.unwrap();
        assert!(engine.list_factors().await.unwrap().is_empty());
        assert_eq!(
            engine.unenroll(&factor_id).await.unwrap_err(),
            AuthError::UnknownFactor
        );
    }

    #[test]
    fn test_time_remaining_in_window_bounds() {
        let engine = MfaEngine::new(Arc::new(MemoryIdentityProvider::new()));
        let remaining = engine.time_remaining_in_window();
        assert!((1..=30).contains(&remaining));
    }
}
