//! Provider-issued JWT inspection
//!
//! Access tokens issued by the identity provider are JWTs. When the signing
//! secret is configured, tokens are validated locally before the provider
//! round-trip so forged or expired tokens are turned away cheaply. Local
//! validation never replaces the round-trip.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use stratix_shared::AssuranceLevel;

/// Claims carried by provider access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderClaims {
    /// Subject (user ID as string, parsed to UUID by the validator)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
    /// Authentication assurance level ("aal1" / "aal2")
    pub aal: Option<String>,
    pub session_id: Option<String>,
}

impl ProviderClaims {
    pub fn assurance_level(&self) -> Option<AssuranceLevel> {
        self.aal.as_deref().and_then(|aal| aal.parse().ok())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

/// Validates provider JWTs
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: Option<DecodingKey>,
}

impl TokenVerifier {
    /// Verifier with no signing secret; only claim inspection is available
    pub fn unsigned() -> Self {
        Self { decoding_key: None }
    }

    pub fn with_secret(secret: &str) -> Self {
        Self {
            decoding_key: if secret.is_empty() {
                None
            } else {
                Some(DecodingKey::from_secret(secret.as_bytes()))
            },
        }
    }

    /// Whether signature validation is available
    pub fn has_secret(&self) -> bool {
        self.decoding_key.is_some()
    }

    /// Validate signature, audience and expiry.
    ///
    /// Returns `Ok(None)` when no secret is configured.
    pub fn validate(&self, token: &str) -> Result<Option<ProviderClaims>, JwtError> {
        let Some(decoding_key) = self.decoding_key.as_ref() else {
            return Ok(None);
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&["authenticated"]);

        match decode::<ProviderClaims>(token, decoding_key, &validation) {
            Ok(data) => Ok(Some(data.claims)),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(JwtError::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => Err(JwtError::Invalid),
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    tracing::warn!("Provider JWT audience validation failed - rejecting token");
                    Err(JwtError::Invalid)
                }
                _ => Err(JwtError::Validation(e.to_string())),
            },
        }
    }
}

/// Read claims without checking the signature.
///
/// Only for tokens the provider has already accepted (e.g. the session it just
/// issued, or a token `get_user` confirmed).
pub fn inspect_claims(token: &str) -> Result<ProviderClaims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;

    decode::<ProviderClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| JwtError::Validation(e.to_string()))
}
