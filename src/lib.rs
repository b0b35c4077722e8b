//! MFT Gateway - Transfer Pipeline Engine
//!
//! The core of a managed file-transfer gateway: everything a protocol driver
//! needs to execute one transfer, independent of the wire protocol.
//!
//! # Modules
//!
//! - [`fsm`] - Generic mutex-protected state machine
//! - [`model`] - Persisted entities (transfers, rules, agents, accounts, credentials)
//! - [`db`] - Persistence capabilities, in-memory and PostgreSQL backends
//! - [`auth`] - Credential handlers and the time-bounded authentication cache
//! - [`transfer`] - Context resolution, path resolution, file access and the pipeline
//! - [`gateway`] - Root object wiring the database, authentication and pipelines
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing subscriber setup

// Generic building blocks
pub mod fsm;

// Persistence
pub mod db;
pub mod model;

// Transfer execution
pub mod auth;
pub mod gateway;
pub mod transfer;

// Ambient
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use auth::{AuthCache, Authenticator};
pub use config::AppConfig;
pub use db::{Access, Database, MemoryDb, PgDb, ReadAccess};
pub use fsm::{FsmError, StateMachine};
pub use gateway::Gateway;
pub use model::{CredOwner, Transfer, TransferError, TransferErrorCode, TransferStatus, TransferStep};
pub use transfer::{
    Pipeline, PipelineError, PipelineHandle, PipelineState, TransferContext, resolve_context,
    resolve_path,
};
