//! Cache-backed authentication entry point.

use std::sync::Arc;

use tracing::{debug, warn};

use super::handlers::{AuthRegistry, PASSWORD};
use super::{AuthCache, AuthError, AuthResult, AuthValue};
use crate::db::ReadAccess;
use crate::model::CredOwner;

/// Checks presented credentials through the registered handlers.
///
/// `password` checks are answered from the [`AuthCache`] while a result is
/// fresh; every other kind is verified each time.
pub struct Authenticator {
    registry: Arc<AuthRegistry>,
    cache: Arc<AuthCache>,
}

impl Authenticator {
    pub fn new(registry: Arc<AuthRegistry>, cache: Arc<AuthCache>) -> Self {
        Self { registry, cache }
    }

    pub fn cache(&self) -> &Arc<AuthCache> {
        &self.cache
    }

    /// Verify `value` as a credential of `kind` belonging to `owner`.
    ///
    /// An unknown (kind, protocol) combination is an error, never a silent
    /// failure. Results are only cached when the handler itself succeeded.
    pub async fn authenticate(
        &self,
        db: &dyn ReadAccess,
        owner: CredOwner,
        kind: &str,
        protocol: &str,
        value: &AuthValue,
    ) -> Result<AuthResult, AuthError> {
        let Some(handler) = self.registry.internal(kind, protocol) else {
            warn!(%owner, kind, protocol, "No authentication handler for credential type");
            return Err(AuthError::UnknownKind {
                kind: kind.to_string(),
                protocol: protocol.to_string(),
            });
        };

        let cache_key = if kind == PASSWORD { value.as_bytes() } else { None };

        if let Some(bytes) = cache_key
            && let Some(cached) = self.cache.get(owner, kind, bytes)
        {
            debug!(%owner, kind, success = cached.success, "Authentication cache hit");
            return Ok(cached);
        }

        let result = handler.authenticate(db, owner, value).await?;

        if let Some(bytes) = cache_key {
            self.cache.insert(owner, kind, bytes, result.clone());
        }
        debug!(%owner, kind, success = result.success, "Credential verified");
        Ok(result)
    }
}
