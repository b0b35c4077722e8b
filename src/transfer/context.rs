//! Transfer Context Resolution
//!
//! Loads everything one execution attempt needs into a single snapshot.
//! Resolution is all-or-nothing: any persistence failure discards the
//! partial result and surfaces as a generic "database error".

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, error};

use crate::config::PathsConfig;
use crate::db::{DbError, ReadAccess, ReadExt, Select};
use crate::model::{
    Client, CredOwner, Credential, LocalAccount, LocalAgent, RemoteAccount, RemoteAgent, Rule,
    Task, TaskChain, Transfer, TransferError,
};

/// The counterpart of a transfer, by role.
#[derive(Debug, Clone, PartialEq)]
pub enum Counterpart {
    /// A partner connected to one of the gateway's servers.
    Server {
        local_agent: LocalAgent,
        local_account: LocalAccount,
        local_agent_creds: Vec<Credential>,
        local_account_creds: Vec<Credential>,
    },
    /// The gateway connects to a partner.
    Client {
        remote_agent: RemoteAgent,
        remote_account: RemoteAccount,
        client: Client,
        remote_agent_creds: Vec<Credential>,
        remote_account_creds: Vec<Credential>,
    },
}

/// Request-scoped snapshot of one transfer and its surroundings.
///
/// Never persisted and never shared between transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferContext {
    pub transfer: Transfer,
    pub rule: Rule,
    pub pre_tasks: Vec<Task>,
    pub post_tasks: Vec<Task>,
    pub error_tasks: Vec<Task>,
    pub transfer_info: BTreeMap<String, Value>,
    pub counterpart: Counterpart,
    pub paths: PathsConfig,
}

impl TransferContext {
    /// Build the context of `transfer`.
    pub async fn resolve(
        db: &dyn ReadAccess,
        transfer: Transfer,
        paths: &PathsConfig,
    ) -> Result<Self, TransferError> {
        let transfer_id = transfer.id;
        Self::load(db, transfer, paths).await.map_err(|e| {
            error!(transfer_id, error = %e, "Failed to resolve the transfer context");
            TransferError::internal("database error")
        })
    }

    async fn load(
        db: &dyn ReadAccess,
        transfer: Transfer,
        paths: &PathsConfig,
    ) -> Result<Self, DbError> {
        let rule: Rule = db.get_by_id(transfer.rule_id).await?;
        let pre_tasks = rule.tasks(db, TaskChain::Pre).await?;
        let post_tasks = rule.tasks(db, TaskChain::Post).await?;
        let error_tasks = rule.tasks(db, TaskChain::Error).await?;
        let transfer_info = transfer.transfer_info(db).await?;

        let counterpart = match (transfer.local_account_id, transfer.remote_account_id) {
            (Some(account_id), None) => {
                let local_account: LocalAccount = db.get_by_id(account_id).await?;
                let local_agent: LocalAgent = db.get_by_id(local_account.local_agent_id).await?;
                Counterpart::Server {
                    local_agent_creds: credentials(db, CredOwner::local_agent(local_agent.id))
                        .await?,
                    local_account_creds: credentials(db, CredOwner::local_account(account_id))
                        .await?,
                    local_agent,
                    local_account,
                }
            }
            (None, Some(account_id)) => {
                let remote_account: RemoteAccount = db.get_by_id(account_id).await?;
                let remote_agent: RemoteAgent =
                    db.get_by_id(remote_account.remote_agent_id).await?;
                let client_id = transfer.client_id.ok_or_else(|| {
                    DbError::validation(format!("transfer {} has no client", transfer.id))
                })?;
                let client: Client = db.get_by_id(client_id).await?;
                Counterpart::Client {
                    remote_agent_creds: credentials(db, CredOwner::remote_agent(remote_agent.id))
                        .await?,
                    remote_account_creds: credentials(db, CredOwner::remote_account(account_id))
                        .await?,
                    remote_agent,
                    remote_account,
                    client,
                }
            }
            _ => {
                return Err(DbError::validation(format!(
                    "transfer {} must have exactly one account",
                    transfer.id
                )));
            }
        };

        debug!(
            transfer_id = transfer.id,
            rule = %rule.name,
            pre = pre_tasks.len(),
            post = post_tasks.len(),
            error = error_tasks.len(),
            "Transfer context resolved"
        );

        Ok(Self {
            transfer,
            rule,
            pre_tasks,
            post_tasks,
            error_tasks,
            transfer_info,
            counterpart,
            paths: paths.clone(),
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.counterpart, Counterpart::Server { .. })
    }

    pub fn tasks(&self, chain: TaskChain) -> &[Task] {
        match chain {
            TaskChain::Pre => &self.pre_tasks,
            TaskChain::Post => &self.post_tasks,
            TaskChain::Error => &self.error_tasks,
        }
    }

    pub fn local_agent(&self) -> Option<&LocalAgent> {
        match &self.counterpart {
            Counterpart::Server { local_agent, .. } => Some(local_agent),
            Counterpart::Client { .. } => None,
        }
    }

    pub fn remote_agent(&self) -> Option<&RemoteAgent> {
        match &self.counterpart {
            Counterpart::Client { remote_agent, .. } => Some(remote_agent),
            Counterpart::Server { .. } => None,
        }
    }
}

/// Load a transfer by id and resolve its context.
pub async fn resolve_context(
    db: &dyn ReadAccess,
    transfer_id: i64,
    paths: &PathsConfig,
) -> Result<TransferContext, TransferError> {
    let transfer: Transfer = db.get_by_id(transfer_id).await.map_err(|e| {
        error!(transfer_id, error = %e, "Failed to load transfer");
        TransferError::internal("database error")
    })?;
    TransferContext::resolve(db, transfer, paths).await
}

async fn credentials(db: &dyn ReadAccess, owner: CredOwner) -> Result<Vec<Credential>, DbError> {
    db.select(Select::new(Credential::owned_by(owner)).order_by("name", true))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PASSWORD;
    use crate::db::{MemoryDb, WriteExt};
    use crate::model::TransferErrorCode;
    use serde_json::json;

    struct Fixture {
        db: MemoryDb,
        rule: Rule,
        server: LocalAgent,
        local_account: LocalAccount,
        partner: RemoteAgent,
        remote_account: RemoteAccount,
        client: Client,
    }

    async fn fixture() -> Fixture {
        let db = MemoryDb::new();
        let mut rule = Rule::new("pull", false);
        db.insert(&mut rule).await.unwrap();
        for (chain, rank, kind) in [
            (TaskChain::Pre, 1, "COPY"),
            (TaskChain::Pre, 0, "EXEC"),
            (TaskChain::Post, 0, "DELETE"),
            (TaskChain::Error, 0, "MOVE"),
        ] {
            db.insert(&mut Task::new(rule.id, chain, rank, kind))
                .await
                .unwrap();
        }

        let mut server = LocalAgent::new("server", "sftp");
        db.insert(&mut server).await.unwrap();
        let mut local_account = LocalAccount::new(server.id, "toto");
        db.insert(&mut local_account).await.unwrap();
        db.insert(&mut Credential::new(
            CredOwner::local_account(local_account.id),
            PASSWORD,
            "sesame",
        ))
        .await
        .unwrap();

        let mut partner = RemoteAgent::new("partner", "sftp");
        db.insert(&mut partner).await.unwrap();
        let mut remote_account = RemoteAccount::new(partner.id, "tata");
        db.insert(&mut remote_account).await.unwrap();
        db.insert(&mut Credential::new(
            CredOwner::remote_account(remote_account.id),
            PASSWORD,
            "secret",
        ))
        .await
        .unwrap();

        let mut client = Client::new("sftp_client", "sftp");
        db.insert(&mut client).await.unwrap();

        Fixture {
            db,
            rule,
            server,
            local_account,
            partner,
            remote_account,
            client,
        }
    }

    #[tokio::test]
    async fn test_resolve_server_context() {
        let f = fixture().await;
        let mut transfer = Transfer::server(f.rule.id, f.local_account.id, "file.txt");
        f.db.insert(&mut transfer).await.unwrap();
        transfer
            .set_transfer_info(&f.db, BTreeMap::from([("key".to_string(), json!("value"))]))
            .await
            .unwrap();

        let ctx = resolve_context(&f.db, transfer.id, &PathsConfig::default())
            .await
            .unwrap();

        assert!(ctx.is_server());
        assert_eq!(ctx.rule, f.rule);
        let pre: Vec<_> = ctx.pre_tasks.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(pre, ["EXEC", "COPY"]);
        assert_eq!(ctx.tasks(TaskChain::Post).len(), 1);
        assert_eq!(ctx.tasks(TaskChain::Error)[0].kind, "MOVE");
        assert_eq!(ctx.transfer_info["key"], json!("value"));

        match &ctx.counterpart {
            Counterpart::Server {
                local_agent,
                local_account,
                local_agent_creds,
                local_account_creds,
            } => {
                assert_eq!(local_agent, &f.server);
                assert_eq!(local_account, &f.local_account);
                assert!(local_agent_creds.is_empty());
                assert_eq!(local_account_creds.len(), 1);
            }
            other => panic!("unexpected counterpart {:?}", other),
        }
        assert!(ctx.remote_agent().is_none());
    }

    #[tokio::test]
    async fn test_resolve_client_context() {
        let f = fixture().await;
        let mut transfer =
            Transfer::client(f.rule.id, f.remote_account.id, f.client.id, "file.txt");
        f.db.insert(&mut transfer).await.unwrap();

        let ctx = TransferContext::resolve(&f.db, transfer, &PathsConfig::default())
            .await
            .unwrap();

        assert!(!ctx.is_server());
        assert_eq!(ctx.remote_agent(), Some(&f.partner));
        assert!(ctx.local_agent().is_none());
        match &ctx.counterpart {
            Counterpart::Client {
                client,
                remote_account_creds,
                ..
            } => {
                assert_eq!(client, &f.client);
                assert_eq!(remote_account_creds[0].value, "secret");
            }
            other => panic!("unexpected counterpart {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_is_generic() {
        let f = fixture().await;
        let mut transfer = Transfer::server(f.rule.id, f.local_account.id, "file.txt");
        f.db.insert(&mut transfer).await.unwrap();

        // Dangling account reference
        transfer.local_account_id = Some(404);
        let err = TransferContext::resolve(&f.db, transfer, &PathsConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, TransferErrorCode::Internal);
        assert_eq!(err.details, "database error");

        let err = resolve_context(&f.db, 9999, &PathsConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.details, "database error");
    }
}
