//! Stratix API Library
//!
//! HTTP surface over the authentication subsystem: configuration, rate-limit
//! and session middleware, health and identity routes.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
