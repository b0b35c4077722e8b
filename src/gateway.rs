//! Gateway root: owns the database, the authenticator and its cache sweeper.
//!
//! Protocol drivers get everything they need from one [`Gateway`]: credential
//! checks, transfer resolution and new pipelines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{AuthCache, AuthError, AuthRegistry, AuthResult, AuthValue, Authenticator};
use crate::config::AppConfig;
use crate::db::{Database, MemoryDb, PgDb};
use crate::model::{CredOwner, TABLES};
use crate::transfer::{
    Pipeline, PipelineError, TaskRunner, TransferContext, resolve_context, resolve_path,
};

pub struct Gateway {
    config: AppConfig,
    db: Arc<dyn Database>,
    authenticator: Authenticator,
    sweeper: JoinHandle<()>,
}

impl Gateway {
    /// Connect the configured database and start the auth cache sweeper.
    ///
    /// Uses PostgreSQL when `postgres_url` is set, the in-memory database
    /// otherwise.
    pub async fn open(config: AppConfig) -> anyhow::Result<Self> {
        let db: Arc<dyn Database> = match &config.postgres_url {
            Some(url) => {
                let db = PgDb::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL")?;
                db.migrate(&TABLES).await.context("failed to create tables")?;
                Arc::new(db)
            }
            None => {
                warn!("No postgres_url configured, using the in-memory database");
                Arc::new(MemoryDb::new())
            }
        };
        Ok(Self::with_database(config, db))
    }

    /// Build a gateway over an already opened database.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_database(config: AppConfig, db: Arc<dyn Database>) -> Self {
        let cache = Arc::new(AuthCache::from_config(&config.auth_cache));
        let sweeper = cache.spawn_sweeper(Duration::from_millis(
            config.auth_cache.sweep_interval_ms,
        ));
        let authenticator = Authenticator::new(Arc::new(AuthRegistry::with_builtins()), cache);

        info!(
            home = %config.paths.gateway_home.display(),
            auth_cache_ms = config.auth_cache.expiration_ms,
            "Gateway initialized"
        );
        Self {
            config,
            db,
            authenticator,
            sweeper,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Check a credential presented to a protocol server or client.
    pub async fn authenticate(
        &self,
        owner: CredOwner,
        kind: &str,
        protocol: &str,
        value: &AuthValue,
    ) -> Result<AuthResult, AuthError> {
        self.authenticator
            .authenticate(self.db.reader(), owner, kind, protocol, value)
            .await
    }

    /// Load transfer `transfer_id` and compute its paths without starting it.
    pub async fn resolve(&self, transfer_id: i64) -> Result<TransferContext, PipelineError> {
        let mut ctx = resolve_context(self.db.reader(), transfer_id, &self.config.paths).await?;
        resolve_path(&mut ctx);
        Ok(ctx)
    }

    /// Start the pipeline of transfer `transfer_id`.
    pub async fn start_pipeline(
        &self,
        transfer_id: i64,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<Pipeline, PipelineError> {
        Pipeline::from_transfer_id(
            Arc::clone(&self.db),
            transfer_id,
            &self.config.paths,
            runner,
            &self.config.pipeline,
        )
        .await
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
