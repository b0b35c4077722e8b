//! Credential Authentication
//!
//! Verifies the credentials presented by connecting partners and accounts.
//!
//! # Components
//!
//! - [`handlers`] - one handler per credential kind, looked up per
//!   (kind, protocol) in an [`AuthRegistry`]
//! - [`cache`] - time-bounded result cache with an injectable [`Clock`]
//! - [`authenticator`] - cache-backed entry point used by protocol drivers
//!
//! # Caching policy
//!
//! Only `password` results are cached, and only when the presented value is
//! text or raw bytes. Results live in one of two independent caches chosen
//! by the owner's side (local vs remote) and are evicted by a periodic sweep.

pub mod authenticator;
pub mod cache;
pub mod handlers;

pub use authenticator::Authenticator;
pub use cache::{AuthCache, Clock, ManualClock, SystemClock};
pub use handlers::{
    AuthRegistry, CredentialHandler, DEFAULT_PROTOCOL, ED25519_PUBLIC_KEY, InternalHandler,
    PASSWORD,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::db::DbError;

/// Authentication errors.
///
/// A failed credential check is not an error: it is an [`AuthResult`] with
/// `success == false`. These variants mean the check itself could not run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("unknown credential type \"{kind}\" for protocol \"{protocol}\"")]
    UnknownKind { kind: String, protocol: String },

    #[error("invalid credential value: {0}")]
    InvalidValue(String),

    #[error("authentication internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl AuthError {
    /// Error code for logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::UnknownKind { .. } => "UNKNOWN_CREDENTIAL_TYPE",
            AuthError::InvalidValue(_) => "INVALID_CREDENTIAL_VALUE",
            AuthError::Internal(_) => "AUTH_INTERNAL_ERROR",
            AuthError::Database(_) => "DATABASE_ERROR",
        }
    }
}

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    pub reason: String,
}

impl AuthResult {
    pub fn success() -> Self {
        Self {
            success: true,
            reason: String::new(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// A credential value presented by a connecting peer.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthValue {
    Text(String),
    Bytes(Vec<u8>),
    /// Anything else a protocol driver may hand over (certificate chains, ...).
    Structured(Value),
}

impl AuthValue {
    /// Raw bytes of a text or byte value; `None` for structured values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AuthValue::Text(s) => Some(s.as_bytes()),
            AuthValue::Bytes(b) => Some(b),
            AuthValue::Structured(_) => None,
        }
    }
}

impl From<&str> for AuthValue {
    fn from(s: &str) -> Self {
        AuthValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for AuthValue {
    fn from(b: Vec<u8>) -> Self {
        AuthValue::Bytes(b)
    }
}
