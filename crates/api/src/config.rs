//! Application configuration

use std::env;

/// Which identity provider backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityProviderKind {
    /// GoTrue-compatible HTTP service
    GoTrue,
    /// In-process provider for local development
    Memory,
}

impl std::str::FromStr for IdentityProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gotrue" | "supabase" => Ok(Self::GoTrue),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid("IDENTITY_PROVIDER must be 'gotrue' or 'memory'")),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Identity provider
    pub identity_provider: IdentityProviderKind,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: Option<String>,
    pub auth_redirect_url: Option<String>,

    // Database
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Rate limiting
    pub rate_limit_sweep_seconds: u64,

    // Session validation
    pub suspicious_identity_patterns: Vec<String>,
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let identity_provider = match non_empty("IDENTITY_PROVIDER") {
            Some(kind) => kind.parse()?,
            None => IdentityProviderKind::GoTrue,
        };

        let (supabase_url, supabase_anon_key) = match identity_provider {
            IdentityProviderKind::GoTrue => (
                non_empty("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?,
                non_empty("SUPABASE_ANON_KEY").ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?,
            ),
            IdentityProviderKind::Memory => (
                non_empty("SUPABASE_URL").unwrap_or_default(),
                non_empty("SUPABASE_ANON_KEY").unwrap_or_default(),
            ),
        };

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Identity provider
            identity_provider,
            supabase_url,
            supabase_anon_key,
            supabase_jwt_secret: match non_empty("SUPABASE_JWT_SECRET") {
                // A short HMAC key makes local signature checks forgeable
                Some(secret) if secret.len() < 32 => {
                    return Err(ConfigError::WeakSecret(
                        "SUPABASE_JWT_SECRET must be at least 32 characters",
                    ));
                }
                other => other,
            },
            auth_redirect_url: non_empty("AUTH_REDIRECT_URL"),

            // Database
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            // Rate limiting
            rate_limit_sweep_seconds: env::var("RATE_LIMIT_SWEEP_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .unwrap_or(60),

            // Session validation
            suspicious_identity_patterns: env::var("SUSPICIOUS_IDENTITY_PATTERNS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
