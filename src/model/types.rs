//! Transfer value types: step, status, error codes and credential owners.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Last durable step reached by a transfer. Ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStep {
    #[default]
    None,
    Setup,
    PreTasks,
    Data,
    PostTasks,
    ErrorTasks,
    Finalization,
}

impl TransferStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStep::None => "NONE",
            TransferStep::Setup => "SETUP",
            TransferStep::PreTasks => "PRE_TASKS",
            TransferStep::Data => "DATA",
            TransferStep::PostTasks => "POST_TASKS",
            TransferStep::ErrorTasks => "ERROR_TASKS",
            TransferStep::Finalization => "FINALIZATION",
        }
    }
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    #[default]
    Planned,
    Running,
    Paused,
    Interrupted,
    Error,
    Done,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Planned => "PLANNED",
            TransferStatus::Running => "RUNNING",
            TransferStatus::Paused => "PAUSED",
            TransferStatus::Interrupted => "INTERRUPTED",
            TransferStatus::Error => "ERROR",
            TransferStatus::Done => "DONE",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer error codes, persisted by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransferErrorCode {
    #[default]
    Ok,
    Unknown,
    Internal,
    Unimplemented,
    Connection,
    ConnectionReset,
    UnknownRemote,
    ExceededLimit,
    BadAuthentication,
    DataTransfer,
    Integrity,
    Finalization,
    ExternalOperation,
    Warning,
    Stopped,
    Canceled,
    FileNotFound,
    Forbidden,
    BadSize,
    ShuttingDown,
}

impl TransferErrorCode {
    pub const ALL: [TransferErrorCode; 20] = [
        TransferErrorCode::Ok,
        TransferErrorCode::Unknown,
        TransferErrorCode::Internal,
        TransferErrorCode::Unimplemented,
        TransferErrorCode::Connection,
        TransferErrorCode::ConnectionReset,
        TransferErrorCode::UnknownRemote,
        TransferErrorCode::ExceededLimit,
        TransferErrorCode::BadAuthentication,
        TransferErrorCode::DataTransfer,
        TransferErrorCode::Integrity,
        TransferErrorCode::Finalization,
        TransferErrorCode::ExternalOperation,
        TransferErrorCode::Warning,
        TransferErrorCode::Stopped,
        TransferErrorCode::Canceled,
        TransferErrorCode::FileNotFound,
        TransferErrorCode::Forbidden,
        TransferErrorCode::BadSize,
        TransferErrorCode::ShuttingDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferErrorCode::Ok => "OK",
            TransferErrorCode::Unknown => "UNKNOWN",
            TransferErrorCode::Internal => "INTERNAL",
            TransferErrorCode::Unimplemented => "UNIMPLEMENTED",
            TransferErrorCode::Connection => "CONNECTION",
            TransferErrorCode::ConnectionReset => "CONNECTION_RESET",
            TransferErrorCode::UnknownRemote => "UNKNOWN_REMOTE",
            TransferErrorCode::ExceededLimit => "EXCEEDED_LIMIT",
            TransferErrorCode::BadAuthentication => "BAD_AUTHENTICATION",
            TransferErrorCode::DataTransfer => "DATA_TRANSFER",
            TransferErrorCode::Integrity => "INTEGRITY",
            TransferErrorCode::Finalization => "FINALIZATION",
            TransferErrorCode::ExternalOperation => "EXTERNAL_OPERATION",
            TransferErrorCode::Warning => "WARNING",
            TransferErrorCode::Stopped => "STOPPED",
            TransferErrorCode::Canceled => "CANCELED",
            TransferErrorCode::FileNotFound => "FILE_NOT_FOUND",
            TransferErrorCode::Forbidden => "FORBIDDEN",
            TransferErrorCode::BadSize => "BAD_SIZE",
            TransferErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Parse a persisted name. Unrecognised names read as `Unknown`.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == name)
            .unwrap_or(TransferErrorCode::Unknown)
    }
}

impl fmt::Display for TransferErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TransferErrorCode {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<TransferErrorCode> for String {
    fn from(code: TransferErrorCode) -> Self {
        code.as_str().to_string()
    }
}

/// An ordinary transfer error: code plus human readable details.
///
/// The default value (code `OK`, no details) means "no error".
#[derive(Error, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[error("{code}: {details}")]
pub struct TransferError {
    pub code: TransferErrorCode,
    pub details: String,
}

impl TransferError {
    pub fn new(code: TransferErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(TransferErrorCode::Internal, details)
    }

    pub fn is_empty(&self) -> bool {
        self.code == TransferErrorCode::Ok && self.details.is_empty()
    }
}

/// Kinds of entity that may own credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    LocalAgent,
    RemoteAgent,
    LocalAccount,
    RemoteAccount,
}

impl OwnerKind {
    /// Name of the credential column referencing this owner kind.
    pub fn column(&self) -> &'static str {
        match self {
            OwnerKind::LocalAgent => "local_agent_id",
            OwnerKind::RemoteAgent => "remote_agent_id",
            OwnerKind::LocalAccount => "local_account_id",
            OwnerKind::RemoteAccount => "remote_account_id",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OwnerKind::LocalAgent => "local agent",
            OwnerKind::RemoteAgent => "remote agent",
            OwnerKind::LocalAccount => "local account",
            OwnerKind::RemoteAccount => "remote account",
        };
        f.write_str(name)
    }
}

/// The owner of a credential: a closed set of entity kinds plus an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredOwner {
    pub kind: OwnerKind,
    pub id: i64,
}

impl CredOwner {
    pub fn new(kind: OwnerKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn local_agent(id: i64) -> Self {
        Self::new(OwnerKind::LocalAgent, id)
    }

    pub fn remote_agent(id: i64) -> Self {
        Self::new(OwnerKind::RemoteAgent, id)
    }

    pub fn local_account(id: i64) -> Self {
        Self::new(OwnerKind::LocalAccount, id)
    }

    pub fn remote_account(id: i64) -> Self {
        Self::new(OwnerKind::RemoteAccount, id)
    }

    /// Owners hosted by this gateway. Selects the "local" authentication cache.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, OwnerKind::LocalAgent | OwnerKind::LocalAccount)
    }

    /// Agents act as servers; accounts log into them.
    pub fn is_server(&self) -> bool {
        matches!(self.kind, OwnerKind::LocalAgent | OwnerKind::RemoteAgent)
    }

    /// Owners whose credentials the gateway checks when they connect or answer
    /// (local accounts logging in, remote partners proving their identity).
    pub fn authenticates_inbound(&self) -> bool {
        matches!(self.kind, OwnerKind::LocalAccount | OwnerKind::RemoteAgent)
    }
}

impl fmt::Display for CredOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.id)
    }
}
