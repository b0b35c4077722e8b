//! Transfer Pipeline Engine
//!
//! Executes one file transfer on behalf of a protocol driver.
//!
//! # Flow
//!
//! ```text
//! resolve_context(id) ──► TransferContext ──► resolve_path ──► Pipeline
//!                                                                 │
//!          pre-tasks → data (read | write) → move → post-tasks → done
//!                                 │
//!                      any failure / signal ──► error ──► in error
//! ```
//!
//! # Invariants
//!
//! 1. **One machine per transfer**: the context and file are owned by the
//!    pipeline's worker; handles share only its machine and the last
//!    persisted snapshot of the transfer
//! 2. **Durable step**: `Transfer.step` only records completed progress, so a
//!    retry resumes from the last durable step
//! 3. **Signals are not errors**: pause/cancel/interrupt change the status
//!    but never the stored error code
//! 4. **Stable paths**: paths are computed once and never recomputed on resume
//! 5. **Flushed progress**: bytes count towards `progress` only once flushed

pub mod context;
pub mod error;
pub mod file;
pub mod paths;
pub mod pipeline;
pub mod state;
pub mod tasks;


// Re-exports for convenience
pub use context::{Counterpart, TransferContext, resolve_context};
pub use error::{ErrorKind, PipelineError};
pub use file::{map_io_error, open_transfer_file};
pub use paths::{build_path, final_destination, rebuild_paths, resolve_path};
pub use pipeline::{Pipeline, PipelineHandle};
pub use state::PipelineState;
pub use tasks::{LoggingTaskRunner, TaskRunner};
