//! Transfers and their custom metadata.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Client, LocalAccount, RemoteAccount, Rule, TransferError, TransferStatus, TransferStep,
    entity_ids,
};
use crate::db::{
    Condition, Database, DbError, Entity, LifecycleHooks, MutHook, ReadAccess, ReadExt, Select,
    WriteExt, unit_of_work,
};

/// One file-movement operation between the gateway and a counterpart.
///
/// Exactly one of `local_account_id` (server role) and `remote_account_id`
/// (client role) is set. `progress` is meaningful once the data step has
/// been entered; a non-zero value on re-entry means the transfer resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(default)]
    pub id: i64,
    pub rule_id: i64,
    #[serde(default)]
    pub local_account_id: Option<i64>,
    #[serde(default)]
    pub remote_account_id: Option<i64>,
    /// Client identity used for outbound connections (client role only).
    #[serde(default)]
    pub client_id: Option<i64>,
    pub src_filename: String,
    /// Empty means "same as `src_filename`".
    #[serde(default)]
    pub dest_filename: String,
    #[serde(default)]
    pub local_path: PathBuf,
    #[serde(default)]
    pub remote_path: String,
    /// Size in bytes, `-1` when unknown.
    #[serde(default = "unknown_size")]
    pub filesize: i64,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub step: TransferStep,
    #[serde(default)]
    pub status: TransferStatus,
    #[serde(default)]
    pub progress: u64,
    /// Number of tasks of the current chain already executed.
    #[serde(default)]
    pub task_number: u32,
    #[serde(default)]
    pub error: TransferError,
    /// Attempts left before the transfer is abandoned. Each start uses one.
    #[serde(default)]
    pub remaining_tries: u32,
    /// Earliest time a failed transfer may be restarted.
    #[serde(default)]
    pub next_retry: Option<DateTime<Utc>>,
    /// Seconds to wait before the next retry.
    #[serde(default)]
    pub next_retry_delay: u32,
    /// Factor applied to `next_retry_delay` after each scheduled retry.
    #[serde(default = "default_increment_factor")]
    pub retry_increment_factor: f32,
}

fn unknown_size() -> i64 {
    -1
}

fn default_increment_factor() -> f32 {
    1.0
}

impl Transfer {
    /// A transfer received by one of the gateway's servers.
    pub fn server(rule_id: i64, local_account_id: i64, src_filename: &str) -> Self {
        Self::blank(rule_id, Some(local_account_id), None, None, src_filename)
    }

    /// A transfer the gateway initiates as a client.
    pub fn client(rule_id: i64, remote_account_id: i64, client_id: i64, src_filename: &str) -> Self {
        Self::blank(
            rule_id,
            None,
            Some(remote_account_id),
            Some(client_id),
            src_filename,
        )
    }

    fn blank(
        rule_id: i64,
        local_account_id: Option<i64>,
        remote_account_id: Option<i64>,
        client_id: Option<i64>,
        src_filename: &str,
    ) -> Self {
        Self {
            id: 0,
            rule_id,
            local_account_id,
            remote_account_id,
            client_id,
            src_filename: src_filename.to_string(),
            dest_filename: String::new(),
            local_path: PathBuf::new(),
            remote_path: String::new(),
            filesize: unknown_size(),
            start: Utc::now(),
            step: TransferStep::None,
            status: TransferStatus::Planned,
            progress: 0,
            task_number: 0,
            error: TransferError::default(),
            remaining_tries: 0,
            next_retry: None,
            next_retry_delay: 0,
            retry_increment_factor: default_increment_factor(),
        }
    }

    /// Allow `tries` attempts, the first retry `delay_secs` after a failure
    /// and each later one `factor` times longer.
    pub fn with_retries(mut self, tries: u32, delay_secs: u32, factor: f32) -> Self {
        self.remaining_tries = tries;
        self.next_retry_delay = delay_secs;
        self.retry_increment_factor = factor;
        self
    }

    /// Mark a new attempt as running, using up one try.
    pub fn begin_attempt(&mut self) {
        self.remaining_tries = self.remaining_tries.saturating_sub(1);
        self.next_retry = None;
        self.status = TransferStatus::Running;
        self.error = TransferError::default();
    }

    /// Schedule the next attempt of a failed transfer, if tries remain.
    ///
    /// Only `Error` and `Interrupted` transfers are retried automatically;
    /// paused and cancelled ones wait for an operator.
    pub fn schedule_retry(&mut self, now: DateTime<Utc>) {
        let retryable = matches!(
            self.status,
            TransferStatus::Error | TransferStatus::Interrupted
        );
        if !retryable || self.remaining_tries == 0 {
            return;
        }

        let delay = TimeDelta::seconds(i64::from(self.next_retry_delay));
        self.next_retry = now.checked_add_signed(delay);
        let grown = self.next_retry_delay as f32 * self.retry_increment_factor;
        self.next_retry_delay = if grown >= u32::MAX as f32 {
            u32::MAX
        } else if grown > 0.0 {
            grown as u32
        } else {
            0
        };
    }

    /// Whether a scheduler may start this transfer at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TransferStatus::Planned => self.next_retry.is_none_or(|at| at <= now),
            TransferStatus::Error | TransferStatus::Interrupted => {
                self.next_retry.is_some_and(|at| at <= now)
            }
            _ => false,
        }
    }

    /// `true` when one of the gateway's servers handles the transfer.
    pub fn is_server(&self) -> bool {
        self.local_account_id.is_some()
    }

    /// File name on the destination side.
    pub fn dest_filename(&self) -> &str {
        if self.dest_filename.is_empty() {
            &self.src_filename
        } else {
            &self.dest_filename
        }
    }

    /// The transfer's custom metadata, keyed by name.
    pub async fn transfer_info(
        &self,
        db: &dyn ReadAccess,
    ) -> Result<BTreeMap<String, Value>, DbError> {
        let infos: Vec<TransferInfo> = db
            .select(Select::new(Condition::all().eq("transfer_id", self.id)))
            .await?;
        Ok(infos.into_iter().map(|i| (i.name, i.value)).collect())
    }

    /// Replace the transfer's custom metadata atomically.
    pub async fn set_transfer_info(
        &self,
        db: &dyn Database,
        info: BTreeMap<String, Value>,
    ) -> Result<(), DbError> {
        let transfer_id = self.id;
        db.transaction(unit_of_work(move |ses| {
            async move {
                ses.delete_all::<TransferInfo>(Condition::all().eq("transfer_id", transfer_id))
                    .await?;
                for (name, value) in info {
                    ses.insert(&mut TransferInfo::new(transfer_id, &name, value))
                        .await?;
                }
                Ok(())
            }
            .boxed()
        }))
        .await
    }
}

fn check_transfer<'a>(
    transfer: &'a mut Transfer,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if transfer.src_filename.is_empty() {
            return Err(DbError::validation("the transfer's source file cannot be empty"));
        }
        if db.count::<Rule>(Condition::id(transfer.rule_id)).await? == 0 {
            return Err(DbError::validation(format!(
                "no rule found with ID {}",
                transfer.rule_id
            )));
        }

        match (transfer.local_account_id, transfer.remote_account_id) {
            (Some(_), Some(_)) => {
                return Err(DbError::validation(
                    "a transfer cannot have both a local and a remote account",
                ));
            }
            (None, None) => {
                return Err(DbError::validation(
                    "a transfer must have either a local or a remote account",
                ));
            }
            (Some(account_id), None) => {
                if db.count::<LocalAccount>(Condition::id(account_id)).await? == 0 {
                    return Err(DbError::validation(format!(
                        "no local account found with ID {}",
                        account_id
                    )));
                }
            }
            (None, Some(account_id)) => {
                if db.count::<RemoteAccount>(Condition::id(account_id)).await? == 0 {
                    return Err(DbError::validation(format!(
                        "no remote account found with ID {}",
                        account_id
                    )));
                }
                let Some(client_id) = transfer.client_id else {
                    return Err(DbError::validation("a client transfer must have a client"));
                };
                if db.count::<Client>(Condition::id(client_id)).await? == 0 {
                    return Err(DbError::validation(format!(
                        "no client found with ID {}",
                        client_id
                    )));
                }
            }
        }
        Ok(())
    }
    .boxed()
}

impl Entity for Transfer {
    const TABLE: &'static str = "transfers";
    const NAME: &'static str = "transfer";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_transfer as MutHook<Transfer>),
            ..LifecycleHooks::none()
        }
    }
}

/// One named metadata value attached to a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    #[serde(default)]
    pub id: i64,
    pub transfer_id: i64,
    pub name: String,
    pub value: Value,
}

impl TransferInfo {
    pub fn new(transfer_id: i64, name: &str, value: Value) -> Self {
        Self {
            id: 0,
            transfer_id,
            name: name.to_string(),
            value,
        }
    }
}

fn check_transfer_info<'a>(
    info: &'a mut TransferInfo,
    db: &'a dyn ReadAccess,
) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if info.name.is_empty() {
            return Err(DbError::validation("the transfer info's name cannot be empty"));
        }
        let duplicates = db
            .count::<TransferInfo>(
                Condition::all()
                    .eq("transfer_id", info.transfer_id)
                    .eq("name", info.name.as_str())
                    .ne("id", info.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "transfer {} already has a property \"{}\"",
                info.transfer_id, info.name
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for TransferInfo {
    const TABLE: &'static str = "transfer_info";
    const NAME: &'static str = "transfer info";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_transfer_info as MutHook<TransferInfo>),
            ..LifecycleHooks::none()
        }
    }
}
