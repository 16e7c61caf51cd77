//! Request middleware: rate limiting, server-trusted authentication and
//! assurance-level gating.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use stratix_auth::{client_key, RateLimitDecision, RequestContext, VerifiedIdentity};
use stratix_shared::AssuranceLevel;

use crate::{error::ApiError, state::AppState};

/// Extract client IP address from request headers.
/// Checks common proxy headers in order of preference.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip") // Cloudflare
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Bearer credential from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn request_origin(request: &Request) -> Option<String> {
    extract_client_ip(request.headers()).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Count the request against its client's window. Rejected requests get a
/// 429; every response carries the throttling headers.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request_origin(&request);
    let key = client_key(origin.as_deref(), bearer_token(request.headers()));
    let (bucket, config) = match *request.method() {
        Method::GET | Method::HEAD | Method::OPTIONS => ("read", &state.rate_limits.read),
        _ => ("write", &state.rate_limits.write),
    };

    let decision = state
        .limiter
        .allow(&format!("ratelimit:{}:{}", bucket, key), config)
        .await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        ApiError::RateLimited {
            retry_after: decision.retry_after_seconds.unwrap_or(1),
        }
        .into_response()
    };
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// Re-verify the bearer token with the identity provider and attach the
/// resulting [`VerifiedIdentity`] to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let ctx = RequestContext::new(
        headers.get(header::USER_AGENT).and_then(|h| h.to_str().ok()),
        headers.get(header::ORIGIN).and_then(|h| h.to_str().ok()),
    );
    let token = bearer_token(headers).map(str::to_string);

    let identity = state
        .validator
        .verify_server(token.as_deref(), &ctx)
        .await?;

    tracing::debug!(
        user_id = %identity.user_id(),
        aal = %identity.assurance_level(),
        "Request authenticated"
    );
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Refuse requests whose verified session is below Aal2. Must run after
/// [`require_auth`].
///
/// Server-side counterpart of `MfaEngine::with_trust_gate`: the client gates
/// sensitive actions on its own session, and this layer enforces the same
/// level against the provider-verified identity so a bypassed client gains
/// nothing.
pub async fn require_aal2(request: Request, next: Next) -> Result<Response, ApiError> {
    let current = request
        .extensions()
        .get::<VerifiedIdentity>()
        .map(VerifiedIdentity::assurance_level)
        .ok_or(ApiError::Unauthorized)?;

    if !current.satisfies(AssuranceLevel::Aal2) {
        tracing::info!(aal = %current, "Step-up required for protected route");
        return Err(ApiError::MfaRequired {
            required: AssuranceLevel::Aal2,
        });
    }
    Ok(next.run(request).await)
}
