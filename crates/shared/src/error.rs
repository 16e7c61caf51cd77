//! Error types for Stratix authentication

use thiserror::Error;

use crate::types::AssuranceLevel;

/// Closed authentication error taxonomy.
///
/// Provider-specific failures are mapped into this enum exactly once, at the
/// identity-provider boundary. Nothing upstream inspects provider error shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Identity not found")]
    IdentityNotFound,

    #[error("Email address has not been confirmed")]
    UnverifiedContact,

    #[error("Too many requests, retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    #[error("Session expired")]
    SessionExpired,

    #[error("Authentication required")]
    NotAuthenticated,

    #[error("Assurance level {required} required")]
    InsufficientAssurance { required: AssuranceLevel },

    #[error("Verification code must be exactly 6 digits")]
    MalformedChallengeCode,

    #[error("Verification code is invalid")]
    InvalidChallengeCode,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Unknown factor")]
    UnknownFactor,

    #[error("Profile not found")]
    ProfileNotFound,

    #[error("Identity provider unavailable")]
    ProviderUnavailable,

    #[error("Unexpected authentication error: {0}")]
    Unexpected(String),
}

impl AuthError {
    /// Conditions callers are expected to branch on rather than treat as failures
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::SessionExpired | Self::InsufficientAssurance { .. }
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::IdentityNotFound => "IDENTITY_NOT_FOUND",
            Self::UnverifiedContact => "UNVERIFIED_CONTACT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::NotAuthenticated => "UNAUTHORIZED",
            Self::InsufficientAssurance { .. } => "MFA_REQUIRED",
            Self::MalformedChallengeCode => "MALFORMED_CODE",
            Self::InvalidChallengeCode => "INVALID_2FA_CODE",
            Self::ChallengeExpired => "CHALLENGE_EXPIRED",
            Self::UnknownFactor => "UNKNOWN_FACTOR",
            Self::ProfileNotFound => "PROFILE_NOT_FOUND",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::Unexpected(_) => "INTERNAL_ERROR",
        }
    }
}
