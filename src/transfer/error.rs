//! Pipeline Error Types
//!
//! Every abnormal exit of a pipeline is one [`PipelineError`]. Only the
//! `Transfer` variant carries a code persisted on the transfer; the others
//! are signals whose effect is limited to the transfer's status.

use thiserror::Error;
use tracing::error;

use crate::db::DbError;
use crate::fsm::FsmError;
use crate::model::{TransferError, TransferErrorCode, TransferStatus};

/// Classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transfer,
    Interrupted,
    Database,
    Paused,
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Ordinary transfer error, persisted on the transfer record.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Shutdown request.
    #[error("transfer interrupted")]
    Interrupted,

    /// Persistence failure; the cause is logged, never surfaced.
    #[error("database error")]
    Database,

    #[error("transfer paused")]
    Paused,

    #[error("transfer cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Shorthand for an ordinary transfer error.
    pub fn transfer(code: TransferErrorCode, details: impl Into<String>) -> Self {
        PipelineError::Transfer(TransferError::new(code, details))
    }

    /// Log a persistence failure with full detail and return the generic variant.
    pub fn database(err: &DbError) -> Self {
        error!(error = %err, "Database error during transfer");
        PipelineError::Database
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Transfer(_) => ErrorKind::Transfer,
            PipelineError::Interrupted => ErrorKind::Interrupted,
            PipelineError::Database => ErrorKind::Database,
            PipelineError::Paused => ErrorKind::Paused,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True for pause, cancel and interrupt requests.
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            PipelineError::Interrupted | PipelineError::Paused | PipelineError::Cancelled
        )
    }

    /// The status a transfer ends with after this error.
    pub fn status(&self) -> TransferStatus {
        match self {
            PipelineError::Transfer(_) | PipelineError::Database => TransferStatus::Error,
            PipelineError::Interrupted => TransferStatus::Interrupted,
            PipelineError::Paused => TransferStatus::Paused,
            PipelineError::Cancelled => TransferStatus::Cancelled,
        }
    }

    /// The error to persist on the transfer record. Signals persist none.
    pub fn transfer_error(&self) -> Option<TransferError> {
        match self {
            PipelineError::Transfer(e) => Some(e.clone()),
            PipelineError::Database => Some(TransferError::internal("database error")),
            _ => None,
        }
    }

    /// Error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Transfer(e) => e.code.as_str(),
            PipelineError::Interrupted => "INTERRUPTED",
            PipelineError::Database => "DATABASE_ERROR",
            PipelineError::Paused => "PAUSED",
            PipelineError::Cancelled => "CANCELLED",
        }
    }
}

impl From<FsmError> for PipelineError {
    fn from(e: FsmError) -> Self {
        PipelineError::transfer(TransferErrorCode::Internal, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_messages_are_fixed() {
        assert_eq!(PipelineError::Paused.to_string(), "transfer paused");
        assert_eq!(PipelineError::Cancelled.to_string(), "transfer cancelled");
        assert_eq!(PipelineError::Interrupted.to_string(), "transfer interrupted");
        assert_eq!(PipelineError::Database.to_string(), "database error");
    }

    #[test]
    fn test_signals_carry_no_transfer_error() {
        for signal in [
            PipelineError::Paused,
            PipelineError::Cancelled,
            PipelineError::Interrupted,
        ] {
            assert!(signal.is_signal());
            assert!(signal.transfer_error().is_none());
        }
        assert_eq!(PipelineError::Cancelled.status(), TransferStatus::Cancelled);
        assert_eq!(PipelineError::Paused.status(), TransferStatus::Paused);
        assert_eq!(
            PipelineError::Interrupted.status(),
            TransferStatus::Interrupted
        );
    }

    #[test]
    fn test_transfer_error_passthrough() {
        let err = PipelineError::transfer(TransferErrorCode::FileNotFound, "missing.txt");
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert_eq!(err.to_string(), "FILE_NOT_FOUND: missing.txt");
        assert_eq!(err.code(), "FILE_NOT_FOUND");
        assert_eq!(err.status(), TransferStatus::Error);
        assert_eq!(
            err.transfer_error().unwrap().code,
            TransferErrorCode::FileNotFound
        );
    }

    #[test]
    fn test_database_error_is_generic() {
        let err = PipelineError::database(&DbError::Internal("relation \"x\" missing".into()));
        assert_eq!(err.kind(), ErrorKind::Database);
        let persisted = err.transfer_error().unwrap();
        assert_eq!(persisted.code, TransferErrorCode::Internal);
        assert_eq!(persisted.details, "database error");
    }

    #[test]
    fn test_fsm_errors_are_internal() {
        let err: PipelineError = FsmError::UnknownState("nowhere".into()).into();
        assert_eq!(err.code(), "INTERNAL");
    }
}
