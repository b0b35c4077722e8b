//! Credential handlers
//!
//! Internal handlers check credentials presented *to* the gateway (local
//! accounts logging in, partners proving their identity). External handlers
//! only validate credentials the gateway presents to others.
//!
//! Handlers are registered per (kind, protocol). A lookup for a protocol
//! without a dedicated handler falls back to the protocol-independent one
//! registered under [`DEFAULT_PROTOCOL`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::VerifyingKey;
use tracing::warn;

use super::{AuthError, AuthResult, AuthValue};
use crate::db::{ReadAccess, ReadExt, Select};
use crate::model::{CredOwner, Credential};

pub const DEFAULT_PROTOCOL: &str = "";

pub const PASSWORD: &str = "password";
pub const ED25519_PUBLIC_KEY: &str = "ed25519_public_key";

/// Validation and storage behaviour shared by every credential kind.
pub trait CredentialHandler: Send + Sync {
    /// Whether an owner may hold at most one credential of this kind.
    fn single_instance(&self) -> bool;

    /// Reject malformed values before they are stored.
    fn validate(&self, value: &str, value2: &str, owner: CredOwner) -> Result<(), AuthError>;

    /// Convert a value to its stored form. Identity by default.
    fn to_db(&self, value: &str, value2: &str) -> Result<(String, String), AuthError> {
        Ok((value.to_string(), value2.to_string()))
    }

    /// Check a value that is already in its stored form (imported or
    /// re-saved). Same as [`validate`](Self::validate) unless the stored form differs.
    fn check_stored(&self, value: &str, value2: &str, owner: CredOwner) -> Result<(), AuthError> {
        self.validate(value, value2, owner)
    }
}

/// A handler able to verify a presented value against the stored credentials.
#[async_trait]
pub trait InternalHandler: CredentialHandler {
    async fn authenticate(
        &self,
        db: &dyn ReadAccess,
        owner: CredOwner,
        value: &AuthValue,
    ) -> Result<AuthResult, AuthError>;
}

type Table<H> = HashMap<String, HashMap<String, Arc<H>>>;

/// Lookup table of credential handlers.
#[derive(Default)]
pub struct AuthRegistry {
    internal: Table<dyn InternalHandler>,
    external: Table<dyn CredentialHandler>,
}

impl AuthRegistry {
    /// A registry with no handler at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.add_internal(PASSWORD, DEFAULT_PROTOCOL, Arc::new(InternalPassword));
        registry.add_internal(ED25519_PUBLIC_KEY, DEFAULT_PROTOCOL, Arc::new(Ed25519PublicKey));
        registry.add_external(PASSWORD, DEFAULT_PROTOCOL, Arc::new(ExternalPassword));
        registry
    }

    pub fn add_internal(&mut self, kind: &str, protocol: &str, handler: Arc<dyn InternalHandler>) {
        self.internal
            .entry(kind.to_string())
            .or_default()
            .insert(protocol.to_string(), handler);
    }

    pub fn add_external(
        &mut self,
        kind: &str,
        protocol: &str,
        handler: Arc<dyn CredentialHandler>,
    ) {
        self.external
            .entry(kind.to_string())
            .or_default()
            .insert(protocol.to_string(), handler);
    }

    pub fn internal(&self, kind: &str, protocol: &str) -> Option<Arc<dyn InternalHandler>> {
        lookup(&self.internal, kind, protocol)
    }

    pub fn external(&self, kind: &str, protocol: &str) -> Option<Arc<dyn CredentialHandler>> {
        lookup(&self.external, kind, protocol)
    }

    /// The handler validating credentials of `kind` for `owner`.
    pub fn for_owner(
        &self,
        kind: &str,
        protocol: &str,
        owner: CredOwner,
    ) -> Option<Arc<dyn CredentialHandler>> {
        if owner.authenticates_inbound() {
            self.internal(kind, protocol)
                .map(|handler| handler as Arc<dyn CredentialHandler>)
        } else {
            self.external(kind, protocol)
        }
    }
}

fn lookup<H: ?Sized>(table: &Table<H>, kind: &str, protocol: &str) -> Option<Arc<H>> {
    let handlers = table.get(kind)?;
    handlers
        .get(protocol)
        .or_else(|| handlers.get(DEFAULT_PROTOCOL))
        .cloned()
}

static BUILTINS: LazyLock<AuthRegistry> = LazyLock::new(AuthRegistry::with_builtins);

/// Shared registry of built-in handlers, used by the credential storage hooks.
pub fn builtins() -> &'static AuthRegistry {
    &BUILTINS
}

async fn stored_credentials(
    db: &dyn ReadAccess,
    owner: CredOwner,
    kind: &str,
) -> Result<Vec<Credential>, AuthError> {
    Ok(db
        .select(Select::new(Credential::owned_by(owner).eq("kind", kind)))
        .await?)
}

// ============================================================================
// password
// ============================================================================

/// Passwords the gateway checks. Stored as Argon2 PHC strings.
pub struct InternalPassword;

impl InternalPassword {
    fn hash(password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Internal(format!("hashing failed: {}", e)))
    }

    fn is_hashed(value: &str) -> bool {
        PasswordHash::new(value).is_ok_and(|hash| hash.algorithm.as_str().starts_with("argon2"))
    }
}

impl CredentialHandler for InternalPassword {
    fn single_instance(&self) -> bool {
        true
    }

    fn validate(&self, value: &str, _value2: &str, _owner: CredOwner) -> Result<(), AuthError> {
        if value.is_empty() {
            return Err(AuthError::InvalidValue("the password cannot be empty".into()));
        }
        Ok(())
    }

    fn to_db(&self, value: &str, value2: &str) -> Result<(String, String), AuthError> {
        Ok((Self::hash(value)?, value2.to_string()))
    }

    fn check_stored(&self, value: &str, _value2: &str, _owner: CredOwner) -> Result<(), AuthError> {
        if !Self::is_hashed(value) {
            return Err(AuthError::InvalidValue(
                "a stored password must be an argon2 hash".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl InternalHandler for InternalPassword {
    async fn authenticate(
        &self,
        db: &dyn ReadAccess,
        owner: CredOwner,
        value: &AuthValue,
    ) -> Result<AuthResult, AuthError> {
        let Some(presented) = value.as_bytes() else {
            return Err(AuthError::InvalidValue("a password must be text".into()));
        };

        let Some(stored) = stored_credentials(db, owner, PASSWORD).await?.pop() else {
            return Ok(AuthResult::failure("no password is set for this owner"));
        };

        let presented = presented.to_vec();
        let hash = stored.value;
        let matches = tokio::task::spawn_blocking(move || {
            PasswordHash::new(&hash)
                .map(|parsed| {
                    Argon2::default()
                        .verify_password(&presented, &parsed)
                        .is_ok()
                })
                .map_err(|e| AuthError::Internal(format!("invalid stored hash: {}", e)))
        })
        .await
        .map_err(|e| AuthError::Internal(format!("verification task failed: {}", e)))??;

        if matches {
            Ok(AuthResult::success())
        } else {
            Ok(AuthResult::failure("invalid password"))
        }
    }
}

/// Passwords the gateway presents to partners. Stored as given.
pub struct ExternalPassword;

impl CredentialHandler for ExternalPassword {
    fn single_instance(&self) -> bool {
        true
    }

    fn validate(&self, value: &str, _value2: &str, _owner: CredOwner) -> Result<(), AuthError> {
        if value.is_empty() {
            return Err(AuthError::InvalidValue("the password cannot be empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// ed25519_public_key
// ============================================================================

/// Base64 encoded Ed25519 public keys a peer may present.
pub struct Ed25519PublicKey;

impl Ed25519PublicKey {
    fn parse(value: &[u8]) -> Result<VerifyingKey, AuthError> {
        let bytes: [u8; 32] = value
            .try_into()
            .map_err(|_| AuthError::InvalidValue("an Ed25519 key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthError::InvalidValue(format!("invalid Ed25519 key: {}", e)))
    }

    fn decode(value: &str) -> Result<VerifyingKey, AuthError> {
        let raw = BASE64
            .decode(value.trim())
            .map_err(|e| AuthError::InvalidValue(format!("invalid base64: {}", e)))?;
        Self::parse(&raw)
    }
}

impl CredentialHandler for Ed25519PublicKey {
    fn single_instance(&self) -> bool {
        false
    }

    fn validate(&self, value: &str, _value2: &str, _owner: CredOwner) -> Result<(), AuthError> {
        Self::decode(value).map(|_| ())
    }
}

#[async_trait]
impl InternalHandler for Ed25519PublicKey {
    async fn authenticate(
        &self,
        db: &dyn ReadAccess,
        owner: CredOwner,
        value: &AuthValue,
    ) -> Result<AuthResult, AuthError> {
        let presented = match value {
            AuthValue::Text(text) => Self::decode(text)?,
            AuthValue::Bytes(raw) => Self::parse(raw)?,
            AuthValue::Structured(_) => {
                return Err(AuthError::InvalidValue(
                    "an Ed25519 key must be text or bytes".into(),
                ));
            }
        };

        for stored in stored_credentials(db, owner, ED25519_PUBLIC_KEY).await? {
            match Self::decode(&stored.value) {
                Ok(key) if key == presented => return Ok(AuthResult::success()),
                Ok(_) => {}
                Err(e) => warn!(
                    credential_id = stored.id,
                    error = %e,
                    "Skipping unreadable stored Ed25519 key"
                ),
            }
        }
        Ok(AuthResult::failure("unknown public key"))
    }
}
