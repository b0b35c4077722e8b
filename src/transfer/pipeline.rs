//! Transfer Pipeline
//!
//! Drives one transfer through its lifecycle. A protocol driver owns the
//! [`Pipeline`] and calls its phases in order:
//!
//! ```text
//! new → pre_tasks → start_data → read/write* → end_data → post_tasks → end_transfer
//! ```
//!
//! Any failing phase moves the machine to `error`, records the outcome on
//! the transfer and ends in `in error`. Pause, cancel and shutdown requests
//! arrive through a [`PipelineHandle`]. The handle halts the transfer itself,
//! so a driver blocked on its peer does not need to call back in; the
//! driver's next call returns the signal, and [`PipelineHandle::signalled`]
//! lets it wake up from a `select!`.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, trace, warn};

use super::context::{TransferContext, resolve_context};
use super::error::PipelineError;
use super::file::{self, map_io_error};
use super::paths::{final_destination, rebuild_paths, resolve_path};
use super::state::{PipelineState, new_machine};
use super::tasks::TaskRunner;
use crate::config::{PathsConfig, PipelineConfig};
use crate::db::{Database, WriteExt};
use crate::fsm::{FsmError, StateMachine};
use crate::model::{
    TaskChain, Transfer, TransferError, TransferErrorCode, TransferStatus, TransferStep,
};

const HASH_BUFFER_SIZE: usize = 32 * 1024;

/// Last persisted view of the transfer, used when a signal ends it.
struct Durable {
    transfer: Transfer,
    /// Partial receive file to remove on cancel.
    partial: Option<PathBuf>,
}

/// State shared between the worker and its handles.
struct Shared {
    transfer_id: i64,
    db: Arc<dyn Database>,
    machine: StateMachine<PipelineState>,
    signal: watch::Sender<Option<PipelineError>>,
    /// Held while the transfer record is written. A signal is only delivered
    /// under this lock, so the worker never persists after a halt.
    durable: Mutex<Durable>,
}

/// Shared view of a running pipeline.
///
/// Cheap to clone; used to observe the lifecycle and to deliver signals.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    pub fn transfer_id(&self) -> i64 {
        self.shared.transfer_id
    }

    pub fn current(&self) -> PipelineState {
        self.shared.machine.current()
    }

    pub fn transition(&self, next: PipelineState) -> Result<(), FsmError> {
        self.shared.machine.transition(next)
    }

    /// True once the pipeline reached `all done` or `in error`.
    pub fn has_ended(&self) -> bool {
        self.shared.machine.has_ended()
    }

    /// Halt the pipeline with `err`.
    ///
    /// Moves the machine through `error` to `in error` and persists the
    /// resulting status right away. The worker's next call returns `err`.
    /// Ignored once the pipeline ended or is already handling an error.
    pub async fn inject(&self, err: PipelineError) {
        let shared = &self.shared;
        let transfer_id = shared.transfer_id;
        let mut durable = shared.durable.lock().await;

        let state = shared.machine.current();
        if state.is_terminal() || state == PipelineState::Error {
            debug!(transfer_id, %state, signal = %err, "Pipeline already ending, signal ignored");
            return;
        }
        if shared.machine.transition(PipelineState::Error).is_err() {
            return;
        }
        shared.signal.send_replace(Some(err.clone()));
        info!(transfer_id, %state, signal = %err, "Transfer stopped");

        if err == PipelineError::Cancelled
            && let Some(partial) = &durable.partial
        {
            file::remove_partial(partial).await;
        }

        record_outcome(&mut durable.transfer, &err);
        if let Err(e) = shared.db.update(&mut durable.transfer).await {
            error!(transfer_id, error = %e, status = %err.status(), "Failed to record the transfer's status");
        }

        if shared.machine.transition(PipelineState::InError).is_ok() {
            debug!(transfer_id, "Transfer ended in error");
        }
    }

    pub async fn pause(&self) {
        self.inject(PipelineError::Paused).await;
    }

    pub async fn cancel(&self) {
        self.inject(PipelineError::Cancelled).await;
    }

    pub async fn interrupt(&self) {
        self.inject(PipelineError::Interrupted).await;
    }

    /// Resolves with the signal once one was delivered.
    pub async fn signalled(&self) -> PipelineError {
        let mut signals = self.shared.signal.subscribe();
        match signals.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).clone().unwrap_or(PipelineError::Interrupted),
            Err(_) => PipelineError::Interrupted,
        }
    }
}

/// Per-transfer execution unit.
pub struct Pipeline {
    shared: Arc<Shared>,
    ctx: TransferContext,
    runner: Arc<dyn TaskRunner>,
    file: Option<File>,
    update_interval: Duration,
    last_update: Instant,
}

impl Pipeline {
    /// Start a pipeline for a resolved context.
    ///
    /// Fills in the transfer's paths (first attempt only), uses up one try
    /// and marks it running.
    pub async fn new(
        db: Arc<dyn Database>,
        mut ctx: TransferContext,
        runner: Arc<dyn TaskRunner>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        resolve_path(&mut ctx);
        ctx.transfer.begin_attempt();

        let (signal, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            transfer_id: ctx.transfer.id,
            db,
            machine: new_machine(),
            signal,
            durable: Mutex::new(Durable {
                transfer: ctx.transfer.clone(),
                partial: partial_file(&ctx),
            }),
        });
        let mut pipeline = Self {
            shared,
            ctx,
            runner,
            file: None,
            update_interval: Duration::from_millis(config.update_interval_ms),
            last_update: Instant::now(),
        };

        let result = pipeline.update_transfer().await;
        pipeline.guard(result).await?;

        info!(
            transfer_id = pipeline.ctx.transfer.id,
            rule = %pipeline.ctx.rule.name,
            step = %pipeline.ctx.transfer.step,
            progress = pipeline.ctx.transfer.progress,
            remaining_tries = pipeline.ctx.transfer.remaining_tries,
            local_path = %pipeline.ctx.transfer.local_path.display(),
            runner = pipeline.runner.name(),
            "Transfer pipeline started"
        );
        Ok(pipeline)
    }

    /// Load and resolve transfer `transfer_id`, then start its pipeline.
    pub async fn from_transfer_id(
        db: Arc<dyn Database>,
        transfer_id: i64,
        paths: &PathsConfig,
        runner: Arc<dyn TaskRunner>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let ctx = resolve_context(db.reader(), transfer_id, paths).await?;
        Self::new(db, ctx, runner, config).await
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn context(&self) -> &TransferContext {
        &self.ctx
    }

    pub fn current(&self) -> PipelineState {
        self.shared.machine.current()
    }

    pub fn has_ended(&self) -> bool {
        self.shared.machine.has_ended()
    }

    // ------------------------------------------------------------------
    // Lifecycle phases
    // ------------------------------------------------------------------

    /// Run the pre-tasks chain, skipping what a previous attempt completed.
    pub async fn pre_tasks(&mut self) -> Result<(), PipelineError> {
        let result = self.run_pre_tasks().await;
        self.guard(result).await
    }

    async fn run_pre_tasks(&mut self) -> Result<(), PipelineError> {
        self.check_signal()?;
        self.transition(PipelineState::PreTasks)?;
        self.run_chain(TransferStep::PreTasks, TaskChain::Pre).await?;
        self.transition(PipelineState::PreTasksDone)
    }

    /// Open the local file and enter `reading` (send) or `writing` (receive).
    pub async fn start_data(&mut self) -> Result<(), PipelineError> {
        let result = self.run_start_data().await;
        self.guard(result).await
    }

    async fn run_start_data(&mut self) -> Result<(), PipelineError> {
        self.check_signal()?;
        self.transition(PipelineState::StartData)?;

        if self.ctx.transfer.step < TransferStep::Data {
            self.ctx.transfer.step = TransferStep::Data;
            self.ctx.transfer.task_number = 0;
            self.update_transfer().await?;
        } else {
            debug!(
                transfer_id = self.ctx.transfer.id,
                offset = self.ctx.transfer.progress,
                "Resuming data transfer"
            );
        }

        self.file = Some(file::open_transfer_file(&mut self.ctx).await?);
        self.update_transfer().await?;

        if self.ctx.rule.is_send {
            self.transition(PipelineState::Reading)
        } else {
            self.transition(PipelineState::Writing)
        }
    }

    /// Read the next chunk of a send transfer. Returns 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        let result = self.read_chunk(buf).await;
        self.guard(result).await
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, PipelineError> {
        let transfer_id = self.ctx.transfer.id;
        self.check_signal()?;
        self.expect_state(PipelineState::Reading)?;
        let file = self.file.as_mut().ok_or_else(no_open_file)?;
        let n = file.read(buf).await.map_err(|e| {
            error!(transfer_id, error = %e, "Failed to read file");
            map_io_error(&e)
        })?;
        self.advance(n).await?;
        Ok(n)
    }

    /// Append one chunk to a receive transfer's file.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), PipelineError> {
        let result = self.write_chunk(buf).await;
        self.guard(result).await
    }

    async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), PipelineError> {
        let transfer_id = self.ctx.transfer.id;
        self.check_signal()?;
        self.expect_state(PipelineState::Writing)?;
        let file = self.file.as_mut().ok_or_else(no_open_file)?;
        file.write_all(buf).await.map_err(|e| {
            error!(transfer_id, error = %e, "Failed to write file");
            map_io_error(&e)
        })?;
        file.flush().await.map_err(|e| {
            error!(transfer_id, error = %e, "Failed to flush file");
            map_io_error(&e)
        })?;
        self.advance(buf.len()).await
    }

    /// Close the file and move a received file to its final destination.
    pub async fn end_data(&mut self) -> Result<(), PipelineError> {
        let result = self.run_end_data().await;
        self.guard(result).await
    }

    async fn run_end_data(&mut self) -> Result<(), PipelineError> {
        self.check_signal()?;
        self.transition(PipelineState::EndData)?;
        self.transition(PipelineState::Close)?;
        self.close_file().await?;
        self.transition(PipelineState::Move)?;
        self.move_file().await?;
        self.transition(PipelineState::DataEnded)
    }

    /// Run the post-tasks chain, skipping what a previous attempt completed.
    pub async fn post_tasks(&mut self) -> Result<(), PipelineError> {
        let result = self.run_post_tasks().await;
        self.guard(result).await
    }

    async fn run_post_tasks(&mut self) -> Result<(), PipelineError> {
        self.check_signal()?;
        self.transition(PipelineState::PostTasks)?;
        self.run_chain(TransferStep::PostTasks, TaskChain::Post).await?;
        self.transition(PipelineState::PostTasksDone)
    }

    /// Mark the transfer done.
    pub async fn end_transfer(&mut self) -> Result<(), PipelineError> {
        let result = self.run_end_transfer().await;
        self.guard(result).await
    }

    async fn run_end_transfer(&mut self) -> Result<(), PipelineError> {
        self.check_signal()?;
        self.transition(PipelineState::EndTransfer)?;

        let transfer = &mut self.ctx.transfer;
        transfer.status = TransferStatus::Done;
        transfer.step = TransferStep::None;
        transfer.task_number = 0;
        self.update_transfer().await?;

        self.transition(PipelineState::AllDone)?;
        info!(
            transfer_id = self.ctx.transfer.id,
            bytes = self.ctx.transfer.progress,
            "Transfer finished"
        );
        Ok(())
    }

    /// Recompute the paths after the file was renamed during the transfer.
    pub async fn rebuild_file_paths(&mut self, new_file: &str) -> Result<(), PipelineError> {
        rebuild_paths(&mut self.ctx, new_file);
        let result = self.update_transfer().await;
        self.guard(result).await
    }

    /// Fail the transfer with an error reported by the protocol driver.
    pub async fn set_error(&mut self, err: TransferError) {
        self.handle_error(PipelineError::Transfer(err)).await;
    }

    /// Compare the SHA-256 of the local file with `expected`.
    ///
    /// Only valid while reading or writing. The file position is restored
    /// afterwards. A mismatch fails the transfer with an `INTEGRITY` error.
    pub async fn check_hash(&mut self, expected: &[u8]) -> Result<(), PipelineError> {
        let result = self.run_check_hash(expected).await;
        self.guard(result).await
    }

    async fn run_check_hash(&mut self, expected: &[u8]) -> Result<(), PipelineError> {
        let transfer_id = self.ctx.transfer.id;
        self.check_signal()?;
        let state = self.shared.machine.current();
        if state != PipelineState::Reading && state != PipelineState::Writing {
            return Err(PipelineError::transfer(
                TransferErrorCode::Internal,
                format!("cannot check the file hash in state \"{}\"", state),
            ));
        }

        let position = self.ctx.transfer.progress;
        let file = self.file.as_mut().ok_or_else(no_open_file)?;
        let io_error = |e: std::io::Error| {
            error!(transfer_id, error = %e, "Failed to hash file");
            PipelineError::Transfer(map_io_error(&e))
        };

        file.flush().await.map_err(io_error)?;
        file.seek(SeekFrom::Start(0)).await.map_err(io_error)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(io_error)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        file.seek(SeekFrom::Start(position)).await.map_err(io_error)?;

        if hasher.finalize().as_slice() != expected {
            warn!(transfer_id, "File hash mismatch");
            return Err(PipelineError::transfer(
                TransferErrorCode::Integrity,
                "file hash does not match expected value",
            ));
        }
        debug!(transfer_id, "File hash verified");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(&self, next: PipelineState) -> Result<(), PipelineError> {
        self.shared.machine.transition(next)?;
        debug!(transfer_id = self.ctx.transfer.id, state = %next, "Pipeline state changed");
        Ok(())
    }

    fn expect_state(&self, expected: PipelineState) -> Result<(), PipelineError> {
        let current = self.shared.machine.current();
        if current != expected {
            error!(
                transfer_id = self.ctx.transfer.id,
                state = %current,
                expected = %expected,
                "Data operation in wrong state"
            );
            return Err(PipelineError::transfer(
                TransferErrorCode::Internal,
                format!("cannot transfer data in state \"{}\"", current),
            ));
        }
        Ok(())
    }

    fn check_signal(&self) -> Result<(), PipelineError> {
        match self.shared.signal.borrow().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Persist the transfer unless a signal already halted it.
    async fn update_transfer(&mut self) -> Result<(), PipelineError> {
        let mut durable = self.shared.durable.lock().await;
        self.check_signal()?;
        self.shared
            .db
            .update(&mut self.ctx.transfer)
            .await
            .map_err(|e| PipelineError::database(&e))?;
        durable.transfer = self.ctx.transfer.clone();
        durable.partial = partial_file(&self.ctx);
        self.last_update = Instant::now();
        Ok(())
    }

    /// Account for `n` transferred bytes; progress is persisted at most
    /// once per update interval.
    async fn advance(&mut self, n: usize) -> Result<(), PipelineError> {
        self.ctx.transfer.progress += n as u64;
        trace!(
            transfer_id = self.ctx.transfer.id,
            bytes = n,
            progress = self.ctx.transfer.progress,
            "Data chunk processed"
        );
        if self.last_update.elapsed() >= self.update_interval {
            return self.update_transfer().await;
        }

        let mut durable = self.shared.durable.lock().await;
        self.check_signal()?;
        durable.transfer.progress = self.ctx.transfer.progress;
        Ok(())
    }

    async fn run_chain(&mut self, step: TransferStep, chain: TaskChain) -> Result<(), PipelineError> {
        let transfer_id = self.ctx.transfer.id;
        if self.ctx.transfer.step > step {
            debug!(transfer_id, %chain, "Task chain already completed, skipping");
            return Ok(());
        }
        if self.ctx.transfer.step < step {
            self.ctx.transfer.step = step;
            self.ctx.transfer.task_number = 0;
            self.update_transfer().await?;
        }

        let tasks = self.ctx.tasks(chain).to_vec();
        let runner = Arc::clone(&self.runner);
        let done = self.ctx.transfer.task_number as usize;
        if done > 0 {
            debug!(transfer_id, %chain, done, "Skipping tasks completed by a previous attempt");
        }

        for (index, task) in tasks.iter().enumerate().skip(done) {
            self.check_signal()?;
            runner.run(task, &self.ctx).await.map_err(|e| {
                warn!(transfer_id, %chain, task = %task.kind, error = %e, "Task failed");
                PipelineError::Transfer(e)
            })?;
            self.ctx.transfer.task_number = u32::try_from(index + 1).unwrap_or(u32::MAX);
            self.update_transfer().await?;
        }
        Ok(())
    }

    async fn close_file(&mut self) -> Result<(), PipelineError> {
        let mut file = self.file.take().ok_or_else(no_open_file)?;
        if !self.ctx.rule.is_send {
            file.flush().await.map_err(|e| map_io_error(&e))?;
            file.sync_all().await.map_err(|e| map_io_error(&e))?;
        }
        let metadata = file.metadata().await.map_err(|e| {
            error!(transfer_id = self.ctx.transfer.id, error = %e, "Failed to get final file info");
            map_io_error(&e)
        })?;
        drop(file);

        if self.ctx.transfer.filesize < 0 {
            self.ctx.transfer.filesize = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
        }
        self.update_transfer().await
    }

    async fn move_file(&mut self) -> Result<(), PipelineError> {
        if self.ctx.rule.is_send {
            return Ok(());
        }
        let dest = final_destination(&self.ctx);
        if dest == self.ctx.transfer.local_path {
            return Ok(());
        }

        file::move_file(&self.ctx.transfer.local_path, &dest).await?;
        debug!(
            transfer_id = self.ctx.transfer.id,
            from = %self.ctx.transfer.local_path.display(),
            to = %dest.display(),
            "File moved to its final destination"
        );
        self.ctx.transfer.local_path = dest;
        self.update_transfer().await
    }

    async fn guard<T>(&mut self, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.handle_error(err).await),
        }
    }

    /// Move to `error`, record the outcome and end in `in error`.
    ///
    /// Returns the error the call ends with: the delivered signal when a
    /// handle already halted the transfer, `err` otherwise.
    async fn handle_error(&mut self, err: PipelineError) -> PipelineError {
        let transfer_id = self.ctx.transfer.id;
        if let Some(mut file) = self.file.take()
            && !self.ctx.rule.is_send
            && let Err(e) = file.flush().await
        {
            warn!(transfer_id, error = %e, "Failed to flush file before stopping");
        }

        let state = {
            let _durable = self.shared.durable.lock().await;
            if let Some(signal) = self.shared.signal.borrow().clone() {
                return signal;
            }
            let state = self.shared.machine.current();
            if state.is_terminal() || state == PipelineState::Error {
                return err;
            }
            if self.shared.machine.transition(PipelineState::Error).is_err() {
                return err;
            }
            state
        };

        match &err {
            PipelineError::Transfer(transfer_err) => {
                error!(
                    transfer_id,
                    %state,
                    code = %transfer_err.code,
                    details = %transfer_err.details,
                    "Transfer failed"
                );
                self.ctx.transfer.error = transfer_err.clone();
                self.run_error_tasks().await;
            }
            PipelineError::Database => {
                error!(transfer_id, %state, "Transfer aborted by a database error");
            }
            signal => {
                info!(transfer_id, %state, %signal, "Transfer stopped");
            }
        }

        record_outcome(&mut self.ctx.transfer, &err);
        if self.update_transfer().await.is_err() {
            warn!(transfer_id, status = %err.status(), "Failed to record the transfer's status");
        }

        if self.shared.machine.transition(PipelineState::InError).is_ok() {
            let elapsed = Utc::now().signed_duration_since(self.ctx.transfer.start);
            debug!(
                transfer_id,
                elapsed_ms = elapsed.num_milliseconds(),
                "Transfer ended in error"
            );
        }
        err
    }

    /// Run the error chain best-effort, then restore the step so a retry
    /// resumes from the last durable step.
    async fn run_error_tasks(&mut self) {
        let transfer_id = self.ctx.transfer.id;
        let old_step = self.ctx.transfer.step;
        let old_task = self.ctx.transfer.task_number;

        self.ctx.transfer.step = TransferStep::ErrorTasks;
        self.ctx.transfer.task_number = 0;
        if self.update_transfer().await.is_err() {
            warn!(transfer_id, "Failed to update transfer step for error-tasks");
        }

        let tasks = self.ctx.error_tasks.clone();
        let runner = Arc::clone(&self.runner);
        for task in &tasks {
            if let Err(e) = runner.run(task, &self.ctx).await {
                error!(transfer_id, task = %task.kind, error = %e, "Error-tasks failed");
                break;
            }
        }

        self.ctx.transfer.step = old_step;
        self.ctx.transfer.task_number = old_task;
        if self.update_transfer().await.is_err() {
            warn!(transfer_id, "Failed to reset transfer step after error-tasks");
        }
    }
}

fn no_open_file() -> PipelineError {
    PipelineError::transfer(TransferErrorCode::Internal, "no file is open")
}

/// The file a cancelled receive leaves behind, if it is not yet in place.
fn partial_file(ctx: &TransferContext) -> Option<PathBuf> {
    let local_path = &ctx.transfer.local_path;
    (!ctx.rule.is_send && !local_path.as_os_str().is_empty() && *local_path != final_destination(ctx))
        .then(|| local_path.clone())
}

/// Apply the end status of `err` and schedule a retry when one is allowed.
fn record_outcome(transfer: &mut Transfer, err: &PipelineError) {
    transfer.status = err.status();
    if let Some(transfer_err) = err.transfer_error() {
        transfer.error = transfer_err;
    }
    transfer.schedule_retry(Utc::now());
}
