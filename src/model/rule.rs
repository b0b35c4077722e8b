//! Transfer rules and their task chains.

use std::fmt;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity_ids;
use crate::db::{
    CheckHook, Condition, DbError, Entity, LifecycleHooks, MutHook, ReadAccess, ReadExt, Select,
};

/// A named policy governing direction, directories and task chains.
///
/// Immutable for the lifetime of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    /// `true` when files flow from the gateway to the partner.
    pub is_send: bool,
    /// Local directory override.
    #[serde(default)]
    pub local_dir: String,
    /// Remote directory override.
    #[serde(default)]
    pub remote_dir: String,
    /// Local temporary receive directory override.
    #[serde(default)]
    pub tmp_local_rcv_dir: String,
}

impl Rule {
    pub fn new(name: &str, is_send: bool) -> Self {
        Self {
            name: name.to_string(),
            is_send,
            ..Default::default()
        }
    }

    /// The rule's tasks for one chain, ordered by rank.
    pub async fn tasks(&self, db: &dyn ReadAccess, chain: TaskChain) -> Result<Vec<Task>, DbError> {
        db.select(
            Select::new(
                Condition::all()
                    .eq("rule_id", self.id)
                    .eq("chain", chain.as_str()),
            )
            .order_by("rank", true),
        )
        .await
    }
}

fn check_rule<'a>(rule: &'a mut Rule, db: &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if rule.name.is_empty() {
            return Err(DbError::validation("the rule's name cannot be empty"));
        }

        let duplicates = db
            .count::<Rule>(
                Condition::all()
                    .eq("name", rule.name.as_str())
                    .eq("is_send", rule.is_send)
                    .ne("id", rule.id),
            )
            .await?;
        if duplicates > 0 {
            return Err(DbError::validation(format!(
                "a {} rule named \"{}\" already exists",
                if rule.is_send { "send" } else { "receive" },
                rule.name
            )));
        }
        Ok(())
    }
    .boxed()
}

fn check_rule_unused<'a>(rule: &'a Rule, db: &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        let in_use = db
            .count::<super::Transfer>(Condition::all().eq("rule_id", rule.id))
            .await?;
        if in_use > 0 {
            return Err(DbError::validation(format!(
                "rule \"{}\" is used by {} transfer(s) and cannot be deleted",
                rule.name, in_use
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for Rule {
    const TABLE: &'static str = "rules";
    const NAME: &'static str = "rule";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_rule as MutHook<Rule>),
            before_delete: Some(check_rule_unused as CheckHook<Rule>),
            ..LifecycleHooks::none()
        }
    }
}

/// The three task chains of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskChain {
    Pre,
    Post,
    Error,
}

impl TaskChain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskChain::Pre => "PRE",
            TaskChain::Post => "POST",
            TaskChain::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action of a rule's task chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: i64,
    pub rule_id: i64,
    pub chain: TaskChain,
    pub rank: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

impl Task {
    pub fn new(rule_id: i64, chain: TaskChain, rank: u32, kind: &str) -> Self {
        Self {
            id: 0,
            rule_id,
            chain,
            rank,
            kind: kind.to_string(),
            args: Value::Null,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

fn check_task<'a>(task: &'a mut Task, db: &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>> {
    async move {
        if task.kind.is_empty() {
            return Err(DbError::validation("the task's type cannot be empty"));
        }
        if db.count::<Rule>(Condition::id(task.rule_id)).await? == 0 {
            return Err(DbError::validation(format!(
                "no rule found with ID {}",
                task.rule_id
            )));
        }

        let taken = db
            .count::<Task>(
                Condition::all()
                    .eq("rule_id", task.rule_id)
                    .eq("chain", task.chain.as_str())
                    .eq("rank", task.rank)
                    .ne("id", task.id),
            )
            .await?;
        if taken > 0 {
            return Err(DbError::validation(format!(
                "rank {} of the {} chain is already taken",
                task.rank, task.chain
            )));
        }
        Ok(())
    }
    .boxed()
}

impl Entity for Task {
    const TABLE: &'static str = "tasks";
    const NAME: &'static str = "task";

    entity_ids!();

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks {
            before_write: Some(check_task as MutHook<Task>),
            ..LifecycleHooks::none()
        }
    }
}
