//! API error types and handling

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stratix_auth::{TrustGateRefusal, ValidationFailure};
use stratix_shared::{AssuranceLevel, AuthError};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Session expired")]
    SessionExpired,
    #[error("Multi-factor authentication required")]
    MfaRequired { required: AssuranceLevel },
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Email address has not been confirmed")]
    UnverifiedContact,
    #[error("Invalid verification code")]
    InvalidChallenge(&'static str),

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Profile not found")]
    ProfileNotFound,

    // Rate limiting
    #[error("Too many requests")]
    RateLimited { retry_after: u64 },

    // Internal errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::InvalidCredentials,
            AuthError::IdentityNotFound | AuthError::NotAuthenticated => ApiError::Unauthorized,
            AuthError::UnverifiedContact => ApiError::UnverifiedContact,
            AuthError::RateLimited { retry_after } => ApiError::RateLimited { retry_after },
            AuthError::SessionExpired => ApiError::SessionExpired,
            AuthError::InsufficientAssurance { required } => ApiError::MfaRequired { required },
            AuthError::MalformedChallengeCode => ApiError::BadRequest(err.to_string()),
            AuthError::InvalidChallengeCode
            | AuthError::ChallengeExpired
            | AuthError::UnknownFactor => ApiError::InvalidChallenge(err.code()),
            AuthError::ProfileNotFound => ApiError::ProfileNotFound,
            AuthError::ProviderUnavailable => ApiError::ServiceUnavailable,
            AuthError::Unexpected(msg) => {
                tracing::error!(error = %msg, "Unexpected authentication error");
                ApiError::Internal
            }
        }
    }
}

impl From<ValidationFailure> for ApiError {
    fn from(failure: ValidationFailure) -> Self {
        AuthError::from(failure).into()
    }
}

impl From<TrustGateRefusal> for ApiError {
    fn from(refusal: TrustGateRefusal) -> Self {
        match refusal {
            TrustGateRefusal::NotAuthenticated => ApiError::Unauthorized,
            TrustGateRefusal::InsufficientAssurance { required, .. } => {
                ApiError::MfaRequired { required }
            }
            TrustGateRefusal::Unavailable(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string())
            }
            ApiError::SessionExpired => {
                (StatusCode::UNAUTHORIZED, "SESSION_EXPIRED", self.to_string())
            }
            ApiError::MfaRequired { required } => (
                StatusCode::FORBIDDEN,
                "MFA_REQUIRED",
                format!(
                    "This action requires assurance level {}. \
                     Complete a second-factor challenge and retry.",
                    required
                ),
            ),
            ApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                self.to_string(),
            ),
            ApiError::UnverifiedContact => {
                (StatusCode::FORBIDDEN, "UNVERIFIED_CONTACT", self.to_string())
            }
            ApiError::InvalidChallenge(code) => {
                (StatusCode::UNAUTHORIZED, *code, self.to_string())
            }

            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::ProfileNotFound => {
                (StatusCode::NOT_FOUND, "PROFILE_NOT_FOUND", self.to_string())
            }

            // Rate limiting
            ApiError::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string())
            }

            // Internal
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();
        if let ApiError::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
