//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use stratix_auth::jwt::TokenVerifier;
use stratix_auth::{
    GoTrueProvider, IdentityProvider, MemoryIdentityProvider, MemoryProfileStore, PgProfileStore,
    ProfileCache, ProfileStore, RateLimitConfig, RateLimiter, SessionValidator,
};

use crate::config::{Config, IdentityProviderKind};
use crate::db;

/// Window budgets applied by the rate-limit middleware
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// GET / HEAD / OPTIONS
    pub read: RateLimitConfig,
    /// Everything else
    pub write: RateLimitConfig,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            read: RateLimitConfig::read_only(),
            write: RateLimitConfig::credentials(),
        }
    }
}

/// State shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn IdentityProvider>,
    pub validator: Arc<SessionValidator>,
    pub profiles: Arc<ProfileCache>,
    pub limiter: RateLimiter,
    pub rate_limits: RateLimitPolicy,
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Wire the subsystem from configuration
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let provider: Arc<dyn IdentityProvider> = match config.identity_provider {
            IdentityProviderKind::GoTrue => {
                let mut provider =
                    GoTrueProvider::new(&config.supabase_url, &config.supabase_anon_key);
                if let Some(redirect_to) = &config.auth_redirect_url {
                    provider = provider.with_redirect_to(redirect_to);
                }
                Arc::new(provider)
            }
            IdentityProviderKind::Memory => {
                tracing::warn!(
                    "Using the in-memory identity provider, sessions will not survive a restart"
                );
                Arc::new(MemoryIdentityProvider::new())
            }
        };

        let pool = match &config.database_url {
            Some(url) => Some(db::create_pool(url, config.database_max_connections).await?),
            None => None,
        };
        let store: Arc<dyn ProfileStore> = match &pool {
            Some(pool) => Arc::new(PgProfileStore::new(pool.clone())),
            None => {
                tracing::warn!("DATABASE_URL not set, serving profiles from memory");
                Arc::new(MemoryProfileStore::new())
            }
        };

        let tokens = match &config.supabase_jwt_secret {
            Some(secret) => TokenVerifier::with_secret(secret),
            None => TokenVerifier::unsigned(),
        };
        let validator = SessionValidator::new(Arc::clone(&provider))
            .with_token_verifier(tokens)
            .with_deny_list(config.suspicious_identity_patterns.as_slice())?;

        Ok(Self::new(config, provider, validator, store, pool))
    }

    pub fn new(
        config: Config,
        provider: Arc<dyn IdentityProvider>,
        validator: SessionValidator,
        store: Arc<dyn ProfileStore>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            validator: Arc::new(validator),
            profiles: Arc::new(ProfileCache::new(store)),
            limiter: RateLimiter::new(),
            rate_limits: RateLimitPolicy::default(),
            pool,
        }
    }

    pub fn with_rate_limits(mut self, rate_limits: RateLimitPolicy) -> Self {
        self.rate_limits = rate_limits;
        self
    }
}
