//! Task execution seam.
//!
//! The pipeline decides which tasks run and records their progress; what a
//! task does is up to the [`TaskRunner`] it is given.

use async_trait::async_trait;
use tracing::info;

use super::context::TransferContext;
use crate::model::{Task, TransferError};

/// Executes one task of a rule's chain.
///
/// Implementations must be safe to call again for a task whose previous
/// execution was interrupted before it was recorded as done.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Get runner name for logging
    fn name(&self) -> &'static str;

    async fn run(&self, task: &Task, ctx: &TransferContext) -> Result<(), TransferError>;
}

/// Runner that only logs the tasks it is handed.
pub struct LoggingTaskRunner;

#[async_trait]
impl TaskRunner for LoggingTaskRunner {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn run(&self, task: &Task, ctx: &TransferContext) -> Result<(), TransferError> {
        info!(
            transfer_id = ctx.transfer.id,
            chain = %task.chain,
            rank = task.rank,
            task = %task.kind,
            "Task executed"
        );
        Ok(())
    }
}
