use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    pub paths: PathsConfig,
    #[serde(default)]
    pub auth_cache: AuthCacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// PostgreSQL connection URL. The in-memory database is used when absent.
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// Gateway-wide directories.
///
/// `gateway_home` anchors every relative directory; the defaults are used
/// when neither the rule nor the agent overrides them.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PathsConfig {
    pub gateway_home: PathBuf,
    #[serde(default)]
    pub default_in_dir: String,
    #[serde(default)]
    pub default_out_dir: String,
    #[serde(default)]
    pub default_tmp_dir: String,
}

/// Authentication result cache timings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthCacheConfig {
    pub expiration_ms: u64,
    /// Kept longer than the expiration so entries are normally already
    /// expired when the sweep finds them.
    pub sweep_interval_ms: u64,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            expiration_ms: 3000,
            sweep_interval_ms: 4000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Minimum delay between two progress writes.
    pub update_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
