//! MFT Gateway - transfer pipeline host
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Database │───▶│   Auth   │───▶│ Pipeline │
//! │  (YAML)  │    │(Mem / PG)│    │ (Cache)  │    │(per xfer)│
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage:
//! - `mft_gateway --env dev` - start and wait for Ctrl-C
//! - `mft_gateway --env dev --transfer 42` - print the resolved paths of a transfer

use anyhow::Context;

use mft_gateway::config::AppConfig;
use mft_gateway::gateway::Gateway;
use mft_gateway::logging::init_logging;

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Transfer to inspect (--transfer argument)
fn get_transfer_id() -> Option<i64> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--transfer" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

// ============================================================
// MAIN
// ============================================================

async fn inspect_transfer(gateway: &Gateway, transfer_id: i64) -> anyhow::Result<()> {
    let ctx = gateway
        .resolve(transfer_id)
        .await
        .with_context(|| format!("failed to resolve transfer {transfer_id}"))?;

    let role = if ctx.is_server() { "server" } else { "client" };
    let direction = if ctx.rule.is_send { "send" } else { "receive" };
    println!("Transfer {transfer_id} ({role}, {direction}) rule \"{}\"", ctx.rule.name);
    println!("  local path:  {}", ctx.transfer.local_path.display());
    println!("  remote path: {}", ctx.transfer.remote_path);
    println!("  step:        {}", ctx.transfer.step);
    println!("  status:      {}", ctx.transfer.status);
    println!("  tries left:  {}", ctx.transfer.remaining_tries);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&app_config);

    tracing::info!("Starting MFT Gateway in {} mode", env);

    let gateway = Gateway::open(app_config).await?;

    if let Some(transfer_id) = get_transfer_id() {
        return inspect_transfer(&gateway, transfer_id).await;
    }

    tracing::info!(
        home = %gateway.config().paths.gateway_home.display(),
        "Gateway ready, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    drop(gateway);
    Ok(())
}
