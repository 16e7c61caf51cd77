//! API routes

pub mod health;
pub mod me;

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{
    middleware::{rate_limit, require_aal2, require_auth},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Sensitive routes: verified session at Aal2
    let sensitive_routes = Router::new()
        .route("/security/overview", get(me::security_overview))
        .route_layer(middleware::from_fn(require_aal2));

    // Protected API routes (auth required) - under /api/v1
    let protected_api_routes = Router::new()
        .route("/me", get(me::me))
        .route("/me/assurance", get(me::assurance))
        .merge(sensitive_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Every /api/v1 request is counted before authentication
    let api_v1_routes = Router::new()
        .merge(protected_api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use stratix_auth::{
        IdentityProvider, MemoryIdentityProvider, MemoryProfileStore, ProfileStore,
        RateLimitConfig, SessionValidator,
    };
    use stratix_shared::{
        AssuranceLevel, Session, SessionDuration, TenantId, UserId, UserProfile, UserRole,
    };
    use tower::ServiceExt;

    use crate::config::{Config, IdentityProviderKind};
    use crate::state::RateLimitPolicy;

    const PASSWORD: &str = "correct horse battery staple";

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            identity_provider: IdentityProviderKind::Memory,
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: None,
            auth_redirect_url: None,
            database_url: None,
            database_max_connections: 1,
            rate_limit_sweep_seconds: 60,
            suspicious_identity_patterns: vec![r"@blocked\.example$".to_string()],
        }
    }

    struct TestApp {
        provider: Arc<MemoryIdentityProvider>,
        store: Arc<MemoryProfileStore>,
        state: AppState,
    }

    impl TestApp {
        fn new() -> Self {
            let provider = Arc::new(MemoryIdentityProvider::new());
            let store = Arc::new(MemoryProfileStore::new());
            let config = test_config();
            let validator =
                SessionValidator::new(Arc::clone(&provider) as Arc<dyn IdentityProvider>)
                    .with_deny_list(config.suspicious_identity_patterns.as_slice())
                    .unwrap();
            let state = AppState::new(
                config,
                Arc::clone(&provider) as Arc<dyn IdentityProvider>,
                validator,
                Arc::clone(&store) as Arc<dyn ProfileStore>,
                None,
            );
            Self {
                provider,
                store,
                state,
            }
        }

        fn with_rate_limits(mut self, rate_limits: RateLimitPolicy) -> Self {
            self.state = self.state.with_rate_limits(rate_limits);
            self
        }

        fn provision(&self, user_id: UserId, email: &str, role: UserRole) {
            self.store.insert(UserProfile {
                user_id,
                tenant_id: TenantId::new(),
                role,
                area_id: None,
                is_active: true,
                full_name: "Rafael Costa".to_string(),
                email: email.to_string(),
                avatar_url: None,
                phone: None,
            });
        }

        async fn sign_in(&self, email: &str) -> Session {
            self.provider
                .sign_in_with_password(email, PASSWORD, SessionDuration::default())
                .await
                .unwrap()
        }

        async fn get(&self, uri: &str, token: Option<&str>) -> Response {
            let mut request = Request::builder().uri(uri).header("x-real-ip", "198.51.100.7");
            if let Some(token) = token {
                request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            create_router(self.state.clone())
                .oneshot(request.body(Body::empty()).unwrap())
                .await
                .unwrap()
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let app = TestApp::new();

        let response = app.get("/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "not_configured");

        assert_eq!(app.get("/health/live", None).await.status(), StatusCode::OK);
        assert_eq!(app.get("/health/ready", None).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_me_requires_a_session() {
        let app = TestApp::new();

        let response = app.get("/api/v1/me", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert_eq!(body_json(response).await["error"]["code"], "UNAUTHORIZED");

        let response = app.get("/api/v1/me", Some("not-a-token")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_me_returns_verified_identity_and_cached_profile() {
        let app = TestApp::new();
        let user_id = app.provider.add_user("rafael@stratix.example", PASSWORD);
        app.provision(user_id, "rafael@stratix.example", UserRole::Manager);
        let session = app.sign_in("rafael@stratix.example").await;

        for _ in 0..2 {
            let response = app.get("/api/v1/me", Some(&session.access_token)).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["user"]["id"], user_id.to_string());
            assert_eq!(body["assurance_level"], "aal1");
            assert_eq!(body["profile"]["role"], "manager");
        }

        // Every request re-verifies with the provider, profiles come from cache
        assert_eq!(app.provider.get_user_calls(), 2);
        assert_eq!(app.store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_me_without_provisioned_profile() {
        let app = TestApp::new();
        app.provider.add_user("new.hire@stratix.example", PASSWORD);
        let session = app.sign_in("new.hire@stratix.example").await;

        let response = app.get("/api/v1/me", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["profile"].is_null());
    }

    #[tokio::test]
    async fn test_revoked_token_is_rejected() {
        let app = TestApp::new();
        app.provider.add_user("leaver@stratix.example", PASSWORD);
        let session = app.sign_in("leaver@stratix.example").await;

        let response = app.get("/api/v1/me/assurance", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::OK);

        app.provider.revoke_token(&session.access_token);
        let response = app.get("/api/v1/me/assurance", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_denied_identity_is_rejected() {
        let app = TestApp::new();
        app.provider.add_user("mallory@blocked.example", PASSWORD);
        let session = app.sign_in("mallory@blocked.example").await;

        let response = app.get("/api/v1/me", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_provider_outage_is_service_unavailable() {
        let app = TestApp::new();
        app.provider.add_user("rafael@stratix.example", PASSWORD);
        let session = app.sign_in("rafael@stratix.example").await;

        app.provider.set_unavailable(true);
        let response = app.get("/api/v1/me", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_security_overview_requires_step_up() {
        let app = TestApp::new();
        let user_id = app.provider.add_user("owner@stratix.example", PASSWORD);
        app.provision(user_id, "owner@stratix.example", UserRole::Owner);
        let session = app.sign_in("owner@stratix.example").await;

        let response = app.get("/api/v1/me/assurance", Some(&session.access_token)).await;
        let body = body_json(response).await;
        assert_eq!(body["current"], "aal1");
        assert_eq!(body["step_up_required"], true);

        let response = app.get("/api/v1/security/overview", Some(&session.access_token)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["code"], "MFA_REQUIRED");

        let enrollment = app.provider.enroll_factor("Phone").await.unwrap();
        let challenge = app.provider.challenge_factor(&enrollment.factor.id).await.unwrap();
        let code = app.provider.current_code(&enrollment.factor.id).unwrap();
        let stepped_up = app
            .provider
            .verify_factor(&enrollment.factor.id, &challenge.id, &code)
            .await
            .unwrap();

        let response = app
            .get("/api/v1/security/overview", Some(&stepped_up.access_token))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["assurance_level"], "aal2");
        assert_eq!(body["role"], "owner");
        assert_eq!(body["sees_all_areas"], true);
        assert_eq!(
            serde_json::from_value::<AssuranceLevel>(body["assurance_level"].clone()).unwrap(),
            AssuranceLevel::Aal2
        );
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_with_headers() {
        let app = TestApp::new().with_rate_limits(RateLimitPolicy {
            read: RateLimitConfig::new(2, Duration::from_secs(60)),
            write: RateLimitConfig::new(2, Duration::from_secs(60)),
        });

        for remaining in ["1", "0"] {
            let response = app.get("/api/v1/me", None).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        }

        let response = app.get("/api/v1/me", None).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0 && retry_after <= 60);
        assert_eq!(body_json(response).await["error"]["code"], "RATE_LIMITED");

        // Health probes are never throttled
        assert_eq!(app.get("/health/live", None).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_keys_by_credential() {
        let app = TestApp::new().with_rate_limits(RateLimitPolicy {
            read: RateLimitConfig::new(1, Duration::from_secs(60)),
            write: RateLimitConfig::new(1, Duration::from_secs(60)),
        });

        assert_eq!(app.get("/api/v1/me", Some("token-a")).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.get("/api/v1/me", Some("token-b")).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            app.get("/api/v1/me", Some("token-a")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
