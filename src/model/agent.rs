//! Local servers, remote partners and outbound clients.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::entity_ids;
use crate::db::{
    CheckHook, Condition, DbError, Entity, LifecycleHooks, MutHook, ReadAccess, ReadExt,
};

/// A server hosted by the gateway.
///
/// When `root_dir` is set, the empty directory overrides default to
/// `in`, `out` and `work` beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalAgent {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub root_dir: String,
    #[serde(default)]
    pub receive_dir: String,
    #[serde(default)]
    pub send_dir: String,
    #[serde(default)]
    pub tmp_receive_dir: String,
}

impl LocalAgent {
    pub fn new(name: &str, protocol: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    fn default_dirs(&mut self) {
        if is_unset(&self.root_dir) {
            return;
        }
        if is_unset(&self.receive_dir) {
            self.receive_dir = "in".to_string();
        }
        if is_unset(&self.send_dir) {
            self.send_dir = "out".to_string();
        }
        if is_unset(&self.tmp_receive_dir) {
            self.tmp_receive_dir = "work".to_string();
        }
    }
}

fn is_unset(dir: &str) -> bool {
    dir.is_empty() || dir == "."
}

fn check_local_agent<'a>(
    agent: &'a mut LocalAgent,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if agent.name.is_empty() {
            return Err(DbError::validation("the agent's name cannot be empty"));
        }
        if agent.protocol.is_empty() {
            return Err(DbError::validation("the agent's protocol cannot be empty"));
        }
        agent.default_dirs();

        let duplicates = db
            .count::<LocalAgent>(
                Condition::all()
                    .eq("name", agent.name.as_str())
                    .ne("id", agent.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a local agent with the same name \"{}\" already exists",
                agent.name
            )));
        }
        Ok(())
    }
    .boxed()
}

fn check_local_agent_unused<'a>(
    agent: &'a LocalAgent,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        let accounts = db
            .count::<super::LocalAccount>(Condition::all().eq("local_agent_id", agent.id))
            .await?;
        if accounts > 0 {
            return Err(DbError::validation(format!(
                "server \"{}\" still has {} account(s)",
                agent.name, accounts
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for LocalAgent {
    const TABLE: &'static str = "local_agents";
    const NAME: &'static str = "local agent";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_local_agent as MutHook<LocalAgent>),
            before_delete: Some(check_local_agent_unused as CheckHook<LocalAgent>),
            ..LifecycleHooks::none()
        }
    }
}

/// A partner the gateway connects to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAgent {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub address: String,
}

impl RemoteAgent {
    pub fn new(name: &str, protocol: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }
}

fn check_remote_agent<'a>(
    agent: &'a mut RemoteAgent,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if agent.name.is_empty() {
            return Err(DbError::validation("the partner's name cannot be empty"));
        }
        if agent.protocol.is_empty() {
            return Err(DbError::validation("the partner's protocol cannot be empty"));
        }

        let duplicates = db
            .count::<RemoteAgent>(
                Condition::all()
                    .eq("name", agent.name.as_str())
                    .ne("id", agent.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a partner with the same name \"{}\" already exists",
                agent.name
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for RemoteAgent {
    const TABLE: &'static str = "remote_agents";
    const NAME: &'static str = "partner";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_remote_agent as MutHook<RemoteAgent>),
            ..LifecycleHooks::none()
        }
    }
}

/// The local identity used by the gateway when it acts as a protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub local_address: String,
}

impl Client {
    pub fn new(name: &str, protocol: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }
}

fn check_client<'a>(client: &'a mut Client, db: &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if client.name.is_empty() {
            return Err(DbError::validation("the client's name cannot be empty"));
        }
        if client.protocol.is_empty() {
            return Err(DbError::validation("the client's protocol cannot be empty"));
        }

        let duplicates = db
            .count::<Client>(
                Condition::all()
                    .eq("name", client.name.as_str())
                    .ne("id", client.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a client with the same name \"{}\" already exists",
                client.name
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for Client {
    const TABLE: &'static str = "clients";
    const NAME: &'static str = "client";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_client as MutHook<Client>),
            ..LifecycleHooks::none()
        }
    }
}
