//! Stratix Shared Types
//!
//! Data model and error taxonomy shared by the authentication subsystem and
//! the API server.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
