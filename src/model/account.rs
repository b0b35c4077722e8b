//! Accounts: logins bound to exactly one agent.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{LocalAgent, RemoteAgent, Transfer, entity_ids};
use crate::db::{
    CheckHook, Condition, DbError, Entity, LifecycleHooks, MutHook, ReadAccess, ReadExt,
};

/// A login partners use to connect to one of the gateway's servers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalAccount {
    #[serde(default)]
    pub id: i64,
    pub local_agent_id: i64,
    pub login: String,
}

impl LocalAccount {
    pub fn new(local_agent_id: i64, login: &str) -> Self {
        Self {
            id: 0,
            local_agent_id,
            login: login.to_string(),
        }
    }
}

/// A login the gateway uses on a partner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAccount {
    #[serde(default)]
    pub id: i64,
    pub remote_agent_id: i64,
    pub login: String,
}

impl RemoteAccount {
    pub fn new(remote_agent_id: i64, login: &str) -> Self {
        Self {
            id: 0,
            remote_agent_id,
            login: login.to_string(),
        }
    }
}

fn check_local_account<'a>(
    account: &'a mut LocalAccount,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if account.login.is_empty() {
            return Err(DbError::validation("the account's login cannot be empty"));
        }
        if db.count::<LocalAgent>(Condition::id(account.local_agent_id)).await? == 0 {
            return Err(DbError::validation(format!(
                "no local agent found with ID {}",
                account.local_agent_id
            )));
        }

        let duplicates = db
            .count::<LocalAccount>(
                Condition::all()
                    .eq("local_agent_id", account.local_agent_id)
                    .eq("login", account.login.as_str())
                    .ne("id", account.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a local account with the same login \"{}\" already exists",
                account.login
            )));
        }
        Ok(())
    }
    .boxed()
}

fn check_remote_account<'a>(
    account: &'a mut RemoteAccount,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if account.login.is_empty() {
            return Err(DbError::validation("the account's login cannot be empty"));
        }
        if db.count::<RemoteAgent>(Condition::id(account.remote_agent_id)).await? == 0 {
            return Err(DbError::validation(format!(
                "no partner found with ID {}",
                account.remote_agent_id
            )));
        }

        let duplicates = db
            .count::<RemoteAccount>(
                Condition::all()
                    .eq("remote_agent_id", account.remote_agent_id)
                    .eq("login", account.login.as_str())
                    .ne("id", account.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a remote account with the same login \"{}\" already exists",
                account.login
            )));
        }
        Ok(())
    }
    .boxed()
}

fn check_local_account_idle<'a>(
    account: &'a LocalAccount,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        let running = db
            .count::<Transfer>(Condition::all().eq("local_account_id", account.id))
            .await?;
        if running > 0 {
            return Err(DbError::validation(
                "this account is currently being used in a running transfer and cannot be deleted",
            ));
        }
        Ok(())
    }
    .boxed()
}

fn check_remote_account_idle<'a>(
    account: &'a RemoteAccount,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        let running = db
            .count::<Transfer>(Condition::all().eq("remote_account_id", account.id))
            .await?;
        if running > 0 {
            return Err(DbError::validation(
                "this account is currently being used in a running transfer and cannot be deleted",
            ));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for LocalAccount {
    const TABLE: &'static str = "local_accounts";
    const NAME: &'static str = "local account";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_local_account as MutHook<LocalAccount>),
            before_delete: Some(check_local_account_idle as CheckHook<LocalAccount>),
            ..LifecycleHooks::none()
        }
    }
}

impl Entity for RemoteAccount {
    const TABLE: &'static str = "remote_accounts";
    const NAME: &'static str = "remote account";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_remote_account as MutHook<RemoteAccount>),
            before_delete: Some(check_remote_account_idle as CheckHook<RemoteAccount>),
            ..LifecycleHooks::none()
        }
    }
}
