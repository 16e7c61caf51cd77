//! Stratix authentication subsystem
//!
//! Session lifecycle, profile caching, MFA trust levels and request rate
//! limiting on top of an external identity provider.

pub mod jwt;
pub mod mfa;
pub mod profile_cache;
pub mod profile_store;
pub mod provider;
pub mod rate_limit;
pub mod session;
pub mod totp;
pub mod validator;

pub use mfa::{MfaEngine, TrustGateRefusal};
pub use profile_cache::ProfileCache;
pub use profile_store::{MemoryProfileStore, PgProfileStore, ProfileStore};
pub use provider::{
    map_provider_error, AuthEvent, GoTrueProvider, IdentityProvider, MemoryIdentityProvider,
    ProviderError,
};
pub use rate_limit::{client_key, RateLimitConfig, RateLimitDecision, RateLimiter};
pub use session::{SessionManager, SessionSnapshot, SessionStatus, SignInOptions};
pub use validator::{
    ClientIdentity, RequestContext, SessionValidator, ValidationFailure, VerifiedIdentity,
};
