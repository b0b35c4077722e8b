//! Credentials bound to exactly one agent or account.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{CredOwner, OwnerKind, entity_ids};
use crate::auth::handlers;
use crate::db::{Condition, DbError, Entity, LifecycleHooks, MutHook, ReadAccess, ReadExt};

/// A (kind, value) pair owned by one agent or account.
///
/// Exactly one of the four owner columns is set. The value is validated and
/// converted to its stored form by the kind's handler before every write.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub id: i64,
    /// Defaults to the kind.
    #[serde(default)]
    pub name: String,
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub value2: String,
    #[serde(default)]
    pub local_agent_id: Option<i64>,
    #[serde(default)]
    pub remote_agent_id: Option<i64>,
    #[serde(default)]
    pub local_account_id: Option<i64>,
    #[serde(default)]
    pub remote_account_id: Option<i64>,
    /// `value` is already in its stored form and must not be converted again.
    #[serde(skip)]
    stored: bool,
}

impl Credential {
    pub fn new(owner: CredOwner, kind: &str, value: &str) -> Self {
        let mut credential = Self {
            kind: kind.to_string(),
            value: value.to_string(),
            ..Default::default()
        };
        credential.set_owner(owner);
        credential
    }

    /// A credential whose value is already in stored form, such as an
    /// Argon2 hash exported from another gateway.
    pub fn imported(owner: CredOwner, kind: &str, stored_value: &str) -> Self {
        let mut credential = Self::new(owner, kind, stored_value);
        credential.stored = true;
        credential
    }

    /// Replace the value with a new clear one, converted on the next write.
    pub fn set_value(&mut self, value: &str, value2: &str) {
        self.value = value.to_string();
        self.value2 = value2.to_string();
        self.stored = false;
    }

    pub fn set_owner(&mut self, owner: CredOwner) {
        self.local_agent_id = None;
        self.remote_agent_id = None;
        self.local_account_id = None;
        self.remote_account_id = None;

        let slot = match owner.kind {
            OwnerKind::LocalAgent => &mut self.local_agent_id,
            OwnerKind::RemoteAgent => &mut self.remote_agent_id,
            OwnerKind::LocalAccount => &mut self.local_account_id,
            OwnerKind::RemoteAccount => &mut self.remote_account_id,
        };
        *slot = Some(owner.id);
    }

    /// The owner, if exactly one owner column is set.
    pub fn owner(&self) -> Option<CredOwner> {
        let owners = [
            self.local_agent_id.map(CredOwner::local_agent),
            self.remote_agent_id.map(CredOwner::remote_agent),
            self.local_account_id.map(CredOwner::local_account),
            self.remote_account_id.map(CredOwner::remote_account),
        ];
        let mut set = owners.into_iter().flatten();
        match (set.next(), set.next()) {
            (Some(owner), None) => Some(owner),
            _ => None,
        }
    }

    /// Condition selecting every credential of `owner`.
    pub fn owned_by(owner: CredOwner) -> Condition {
        Condition::all().eq(owner.kind.column(), owner.id)
    }
}

fn owner_count(credential: &Credential) -> usize {
    [
        credential.local_agent_id,
        credential.remote_agent_id,
        credential.local_account_id,
        credential.remote_account_id,
    ]
    .iter()
    .filter(|id| id.is_some())
    .count()
}

fn check_credential<'a>(
    credential: &'a mut Credential,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if credential.kind.is_empty() {
            return Err(DbError::validation("the credential's type cannot be empty"));
        }
        if credential.name.is_empty() {
            credential.name = credential.kind.clone();
        }

        let owner = match owner_count(credential) {
            0 => return Err(DbError::validation("the credential is missing an owner")),
            1 => credential
                .owner()
                .ok_or_else(|| DbError::validation("the credential is missing an owner"))?,
            _ => return Err(DbError::validation("the credential cannot have multiple owners")),
        };

        let handler = handlers::builtins()
            .for_owner(&credential.kind, handlers::DEFAULT_PROTOCOL, owner)
            .ok_or_else(|| {
                DbError::validation(format!(
                    "unknown credential type \"{}\" for a {}",
                    credential.kind, owner.kind
                ))
            })?;

        let same_name = db
            .count::<Credential>(
                Credential::owned_by(owner)
                    .eq("name", credential.name.as_str())
                    .ne("id", credential.id),
            )
            .await?;
        if same_name > 0 {
            return Err(DbError::validation(format!(
                "a credential named \"{}\" already exists for this {}",
                credential.name, owner.kind
            )));
        }

        if handler.single_instance() {
            let same_kind = db
                .count::<Credential>(
                    Credential::owned_by(owner)
                        .eq("kind", credential.kind.as_str())
                        .ne("id", credential.id),
                )
                .await?;
            if same_kind > 0 {
                return Err(DbError::validation(format!(
                    "only one \"{}\" credential is allowed per {}",
                    credential.kind, owner.kind
                )));
            }
        }

        if credential.stored {
            return handler
                .check_stored(&credential.value, &credential.value2, owner)
                .map_err(|e| DbError::validation(e.to_string()));
        }

        handler
            .validate(&credential.value, &credential.value2, owner)
            .map_err(|e| DbError::validation(e.to_string()))?;

        let (value, value2) = handler
            .to_db(&credential.value, &credential.value2)
            .map_err(|e| DbError::Internal(e.to_string()))?;
        credential.value = value;
        credential.value2 = value2;
        credential.stored = true;
        Ok(())
    }
    .boxed()
}

fn mark_stored<'a>(
    credential: &'a mut Credential,
    _db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    credential.stored = true;
    futures::future::ready(Ok(())).boxed()
}

impl Entity for Credential {
    const TABLE: &'static str = "credentials";
    const NAME: &'static str = "credential";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_credential as MutHook<Credential>),
            after_read: Some(mark_stored as MutHook<Credential>),
            ..LifecycleHooks::none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ED25519_PUBLIC_KEY, PASSWORD};
    use crate::db::{MemoryDb, Select, WriteExt};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use ed25519_dalek::SigningKey;

    fn public_key(seed: u8) -> String {
        BASE64.encode(SigningKey::from_bytes(&[seed; 32]).verifying_key().as_bytes())
    }

    #[tokio::test]
    async fn test_password_hashed_for_inbound_owner() {
        let db = MemoryDb::new();
        let owner = CredOwner::local_account(1);

        let mut cred = Credential::new(owner, PASSWORD, "sesame");
        db.insert(&mut cred).await.unwrap();
        assert_eq!(cred.name, PASSWORD);
        assert!(cred.value.starts_with("$argon2"));

        let mut stored: Credential = db.get_by_id(cred.id).await.unwrap();
        assert_eq!(stored.value, cred.value);

        // Re-saving a loaded credential keeps its hash
        db.update(&mut stored).await.unwrap();
        assert_eq!(stored.value, cred.value);

        stored.set_value("open sesame", "");
        db.update(&mut stored).await.unwrap();
        assert!(stored.value.starts_with("$argon2"));
        assert_ne!(stored.value, cred.value);
    }

    #[tokio::test]
    async fn test_submitted_hash_is_hashed_again() {
        let db = MemoryDb::new();
        let owner = CredOwner::local_account(1);
        let mut original = Credential::new(owner, PASSWORD, "sesame");
        db.insert(&mut original).await.unwrap();

        let mut forged = Credential::new(CredOwner::local_account(2), PASSWORD, &original.value);
        db.insert(&mut forged).await.unwrap();
        assert_ne!(forged.value, original.value);

        let mut imported = Credential::imported(CredOwner::local_account(3), PASSWORD, &original.value);
        db.insert(&mut imported).await.unwrap();
        assert_eq!(imported.value, original.value);

        let mut not_a_hash = Credential::imported(CredOwner::local_account(4), PASSWORD, "sesame");
        assert!(matches!(
            db.insert(&mut not_a_hash).await.unwrap_err(),
            DbError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_password_kept_for_outbound_owner() {
        let db = MemoryDb::new();
        let mut cred = Credential::new(CredOwner::remote_account(1), PASSWORD, "sesame");
        db.insert(&mut cred).await.unwrap();
        assert_eq!(cred.value, "sesame");
    }

    #[tokio::test]
    async fn test_single_instance_and_unique_names() {
        let db = MemoryDb::new();
        let owner = CredOwner::remote_agent(3);

        db.insert(&mut Credential::new(owner, PASSWORD, "a")).await.unwrap();
        let mut second = Credential::new(owner, PASSWORD, "b");
        second.name = "other".into();
        assert!(matches!(
            db.insert(&mut second).await.unwrap_err(),
            DbError::Validation(_)
        ));

        let mut key1 = Credential::new(owner, ED25519_PUBLIC_KEY, &public_key(1));
        key1.name = "key".into();
        db.insert(&mut key1).await.unwrap();

        let mut key2 = Credential::new(owner, ED25519_PUBLIC_KEY, &public_key(2));
        key2.name = "key".into();
        assert!(db.insert(&mut key2).await.is_err());
        key2.name = "key2".into();
        db.insert(&mut key2).await.unwrap();

        // Same name on another owner is fine
        db.insert(&mut Credential::new(CredOwner::remote_agent(4), PASSWORD, "a"))
            .await
            .unwrap();

        let keys: Vec<Credential> = db
            .select(Select::new(
                Credential::owned_by(owner).eq("kind", ED25519_PUBLIC_KEY),
            ))
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_owner_and_kind_checks() {
        let db = MemoryDb::new();

        let mut orphan = Credential::new(CredOwner::local_agent(1), PASSWORD, "x");
        orphan.local_agent_id = None;
        assert!(db.insert(&mut orphan).await.is_err());

        let mut twice = Credential::new(CredOwner::local_agent(1), PASSWORD, "x");
        twice.remote_agent_id = Some(2);
        assert!(twice.owner().is_none());
        assert!(db.insert(&mut twice).await.is_err());

        let mut unknown = Credential::new(CredOwner::local_account(1), "kerberos", "x");
        assert!(db.insert(&mut unknown).await.is_err());

        // Public keys are only checked for owners the gateway authenticates
        let mut outbound_key =
            Credential::new(CredOwner::remote_account(1), ED25519_PUBLIC_KEY, &public_key(1));
        assert!(db.insert(&mut outbound_key).await.is_err());

        let mut bad_key = Credential::new(CredOwner::local_account(1), ED25519_PUBLIC_KEY, "AAAA");
        assert!(db.insert(&mut bad_key).await.is_err());

        let mut empty = Credential::new(CredOwner::local_account(1), PASSWORD, "");
        assert!(db.insert(&mut empty).await.is_err());
    }
}
