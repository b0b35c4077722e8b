//! Gateway Data Model
//!
//! Persisted entities and the value types they carry. Every entity is an
//! [`Entity`](crate::db::Entity) stored as a JSON document; invariants are
//! enforced by the lifecycle hooks each entity registers.

/// Implements the id accessors of [`Entity`] for a struct with an `id: i64` field.
macro_rules! entity_ids {
    () => {
        fn id(&self) -> i64 {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }
    };
}

pub(crate) use entity_ids;

pub mod account;
pub mod agent;
pub mod credential;
pub mod rule;
pub mod transfer;
pub mod types;

pub use account::{LocalAccount, RemoteAccount};
pub use agent::{Client, LocalAgent, RemoteAgent};
pub use credential::Credential;
pub use rule::{Rule, Task, TaskChain};
pub use transfer::{Transfer, TransferInfo};
pub use types::{
    CredOwner, OwnerKind, TransferError, TransferErrorCode, TransferStatus, TransferStep,
};

use crate::db::Entity;

/// Every collection of the model, in dependency order.
pub const TABLES: [&str; 10] = [
    Rule::TABLE,
    Task::TABLE,
    LocalAgent::TABLE,
    RemoteAgent::TABLE,
    Client::TABLE,
    LocalAccount::TABLE,
    RemoteAccount::TABLE,
    Credential::TABLE,
    Transfer::TABLE,
    TransferInfo::TABLE,
];
