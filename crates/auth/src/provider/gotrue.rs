//! GoTrue-compatible identity provider client
//!
//! Talks to the `/auth/v1` API of a Supabase / GoTrue deployment. Holds the
//! local session the way a browser client library would and emits lifecycle
//! events after each successful call that changes it.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use stratix_shared::{
    AssuranceLevel, AssuranceLevels, FactorEnrollment, FactorStatus, FactorType, MfaChallenge,
    MfaFactor, Session, SessionDuration, SignOutScope, UserId,
};
use time::OffsetDateTime;

use super::{AuthEvent, EventHub, EventReceiver, IdentityProvider, ProviderError, ProviderUser};
use crate::jwt::inspect_claims;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    expires_at: Option<i64>,
    user: Option<GoTrueUser>,
}

#[derive(Debug, Deserialize)]
struct GoTrueFactor {
    id: String,
    factor_type: String,
    status: String,
    friendly_name: Option<String>,
}

impl GoTrueFactor {
    fn into_factor(self) -> Option<MfaFactor> {
        if self.factor_type != "totp" {
            return None;
        }
        Some(MfaFactor {
            id: self.id,
            factor_type: FactorType::Totp,
            status: if self.status == "verified" {
                FactorStatus::Verified
            } else {
                FactorStatus::Unverified
            },
            friendly_name: self.friendly_name,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    email: Option<String>,
    email_confirmed_at: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Value,
    #[serde(default)]
    factors: Option<Vec<GoTrueFactor>>,
}

impl GoTrueUser {
    fn into_provider_user(self, aal: Option<AssuranceLevel>) -> ProviderUser {
        ProviderUser {
            id: self.id,
            email: self.email,
            email_confirmed: self.email_confirmed_at.is_some(),
            user_metadata: self.user_metadata,
            factors: self
                .factors
                .unwrap_or_default()
                .into_iter()
                .filter_map(GoTrueFactor::into_factor)
                .collect(),
            aal,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TotpEnrollment {
    qr_code: String,
    secret: String,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    id: String,
    friendly_name: Option<String>,
    totp: TotpEnrollment,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    id: String,
    expires_at: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error_code: Option<String>,
    code: Option<serde_json::Value>,
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn code(&self) -> Option<String> {
        self.error_code.clone().or_else(|| match &self.code {
            Some(serde_json::Value::String(code)) => Some(code.clone()),
            _ => None,
        })
    }

    fn message(&self) -> String {
        self.msg
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "unknown provider error".to_string())
    }
}

fn transport(err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Decode(err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn timestamp(secs: i64) -> Result<OffsetDateTime, ProviderError> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| ProviderError::Decode(e.to_string()))
}

// =============================================================================
// Provider
// =============================================================================

/// HTTP client for a GoTrue-compatible identity service
pub struct GoTrueProvider {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    redirect_to: Option<String>,
    local: RwLock<Option<Session>>,
    events: EventHub,
}

impl GoTrueProvider {
    pub fn new(base_url: &str, anon_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            redirect_to: None,
            local: RwLock::new(None),
            events: EventHub::new(),
        }
    }

    /// Where external-provider sign-ins return to
    pub fn with_redirect_to(mut self, redirect_to: &str) -> Self {
        self.redirect_to = Some(redirect_to.to_string());
        self
    }

    /// Restore a previously persisted session
    pub fn with_session(self, session: Session) -> Self {
        self.store(Some(session));
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn load(&self) -> Option<Session> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, session: Option<Session>) {
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn current(&self) -> Result<Session, ProviderError> {
        self.load().ok_or(ProviderError::NoSession)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.endpoint(path))
            .header("apikey", &self.anon_key)
    }

    fn authed(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, ProviderError> {
        let session = self.current()?;
        Ok(self
            .request(method, path)
            .bearer_auth(session.access_token))
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body: ErrorBody = response.json().await.unwrap_or_default();

        tracing::debug!(
            status,
            code = ?body.code(),
            "Identity provider returned an error"
        );

        ProviderError::Api {
            status,
            code: body.code(),
            message: body.message(),
            retry_after,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let response = request.send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response.json::<T>().await.map_err(transport)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), ProviderError> {
        let response = request.send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }

    fn session_from(
        tokens: TokenResponse,
        user_id: Option<UserId>,
        issued_at: OffsetDateTime,
        duration: SessionDuration,
    ) -> Result<Session, ProviderError> {
        let now = OffsetDateTime::now_utc();
        let user_id = match (user_id, tokens.user.as_ref()) {
            (Some(id), _) => id,
            (None, Some(user)) => user
                .id
                .parse()
                .map_err(|_| ProviderError::Decode(format!("invalid user id {}", user.id)))?,
            (None, None) => {
                return Err(ProviderError::Decode(
                    "token response without user".to_string(),
                ))
            }
        };
        let expires_at = match tokens.expires_at {
            Some(at) => timestamp(at)?,
            None => now + time::Duration::seconds(tokens.expires_in),
        };
        Ok(Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            issued_at,
            user_id,
            duration,
        })
    }

    async fn fetch_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError> {
        let user: GoTrueUser = self
            .send(
                self.request(reqwest::Method::GET, "user")
                    .bearer_auth(access_token),
            )
            .await?;
        let aal = inspect_claims(access_token)
            .ok()
            .and_then(|claims| claims.assurance_level());
        Ok(user.into_provider_user(aal))
    }
}

#[async_trait]
impl IdentityProvider for GoTrueProvider {
    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        Ok(self.load())
    }

    async fn get_user(&self, access_token: &str) -> Result<ProviderUser, ProviderError> {
        self.fetch_user(access_token).await
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        duration: SessionDuration,
    ) -> Result<Session, ProviderError> {
        let tokens: TokenResponse = self
            .send(
                self.request(reqwest::Method::POST, "token")
                    .query(&[("grant_type", "password")])
                    .json(&serde_json::json!({ "email": email, "password": password })),
            )
            .await?;
        let session = Self::session_from(tokens, None, OffsetDateTime::now_utc(), duration)?;

        self.store(Some(session.clone()));
        self.events.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_in_with_otp(&self, email: &str) -> Result<(), ProviderError> {
        let mut body = serde_json::json!({ "email": email, "create_user": false });
        if let Some(redirect_to) = &self.redirect_to {
            body["email_redirect_to"] = serde_json::Value::String(redirect_to.clone());
        }
        self.send_empty(self.request(reqwest::Method::POST, "otp").json(&body))
            .await
    }

    async fn sign_in_with_oauth(&self, provider: &str) -> Result<String, ProviderError> {
        let mut params = vec![("provider", provider.to_string())];
        if let Some(redirect_to) = &self.redirect_to {
            params.push(("redirect_to", redirect_to.clone()));
        }
        reqwest::Url::parse_with_params(&self.endpoint("authorize"), &params)
            .map(|url| url.to_string())
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn sign_out(&self, scope: SignOutScope) -> Result<(), ProviderError> {
        let request = self
            .authed(reqwest::Method::POST, "logout")?
            .query(&[("scope", scope.as_str())]);
        match self.send_empty(request).await {
            Ok(()) => {}
            // already gone provider-side
            Err(ProviderError::Api { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::NOT_FOUND.as_u16() => {}
            Err(e) => return Err(e),
        }

        if scope.clears_local() {
            self.store(None);
            self.events.emit(AuthEvent::SignedOut);
        }
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, ProviderError> {
        let current = self.current()?;
        if current.exceeds_lifetime_at(OffsetDateTime::now_utc()) {
            self.store(None);
            return Err(ProviderError::api(401, "session_expired", "Session expired"));
        }

        let tokens: TokenResponse = self
            .send(
                self.request(reqwest::Method::POST, "token")
                    .query(&[("grant_type", "refresh_token")])
                    .json(&serde_json::json!({ "refresh_token": current.refresh_token })),
            )
            .await?;
        let session = Self::session_from(
            tokens,
            Some(current.user_id),
            current.issued_at,
            current.duration,
        )?;

        self.store(Some(session.clone()));
        self.events.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn update_user(
        &self,
        metadata: serde_json::Value,
    ) -> Result<ProviderUser, ProviderError> {
        let session = self.current()?;
        let user: GoTrueUser = self
            .send(
                self.authed(reqwest::Method::PUT, "user")?
                    .json(&serde_json::json!({ "data": metadata })),
            )
            .await?;
        let aal = inspect_claims(&session.access_token)
            .ok()
            .and_then(|claims| claims.assurance_level());

        self.events.emit(AuthEvent::UserUpdated(session));
        Ok(user.into_provider_user(aal))
    }

    async fn enroll_factor(&self, friendly_name: &str) -> Result<FactorEnrollment, ProviderError> {
        let enrolled: EnrollResponse = self
            .send(self.authed(reqwest::Method::POST, "factors")?.json(&serde_json::json!({
                "factor_type": "totp",
                "friendly_name": friendly_name,
                "issuer": crate::totp::TOTP_ISSUER,
            })))
            .await?;

        Ok(FactorEnrollment {
            factor: MfaFactor {
                id: enrolled.id,
                factor_type: FactorType::Totp,
                status: FactorStatus::Unverified,
                friendly_name: enrolled.friendly_name,
            },
            secret: enrolled.totp.secret,
            uri: enrolled.totp.uri,
            qr_code: enrolled.totp.qr_code,
        })
    }

    async fn challenge_factor(&self, factor_id: &str) -> Result<MfaChallenge, ProviderError> {
        let challenge: ChallengeResponse = self
            .send(self.authed(
                reqwest::Method::POST,
                &format!("factors/{}/challenge", factor_id),
            )?)
            .await?;

        Ok(MfaChallenge {
            id: challenge.id,
            factor_id: factor_id.to_string(),
            expires_at: timestamp(challenge.expires_at)?,
        })
    }

    async fn verify_factor(
        &self,
        factor_id: &str,
        challenge_id: &str,
        code: &str,
    ) -> Result<Session, ProviderError> {
        let current = self.current()?;
        let tokens: TokenResponse = self
            .send(
                self.authed(reqwest::Method::POST, &format!("factors/{}/verify", factor_id))?
                    .json(&serde_json::json!({ "challenge_id": challenge_id, "code": code })),
            )
            .await?;
        let session = Self::session_from(
            tokens,
            Some(current.user_id),
            current.issued_at,
            current.duration,
        )?;

        self.store(Some(session.clone()));
        self.events
            .emit(AuthEvent::MfaChallengeVerified(session.clone()));
        Ok(session)
    }

    async fn list_factors(&self) -> Result<Vec<MfaFactor>, ProviderError> {
        let session = self.current()?;
        Ok(self.fetch_user(&session.access_token).await?.factors)
    }

    async fn unenroll_factor(&self, factor_id: &str) -> Result<(), ProviderError> {
        self.send_empty(self.authed(reqwest::Method::DELETE, &format!("factors/{}", factor_id))?)
            .await
    }

    async fn get_assurance_level(&self) -> Result<AssuranceLevels, ProviderError> {
        let session = self.current()?;
        let current = inspect_claims(&session.access_token)
            .ok()
            .and_then(|claims| claims.assurance_level())
            .unwrap_or(AssuranceLevel::Aal1);
        let user = self.fetch_user(&session.access_token).await?;
        let next = if user.factors.iter().any(MfaFactor::is_verified) {
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
