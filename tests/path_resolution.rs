//! Path resolution through the public API, from a stored transfer to its
//! local and remote paths.

use std::path::PathBuf;

use mft_gateway::config::PathsConfig;
use mft_gateway::db::{MemoryDb, ReadAccess, WriteExt};
use mft_gateway::model::{
    Client, LocalAccount, LocalAgent, RemoteAccount, RemoteAgent, Rule, Transfer, TransferStep,
};
use mft_gateway::transfer::{TransferContext, final_destination, resolve_context, resolve_path};

fn gateway_paths() -> PathsConfig {
    PathsConfig {
        gateway_home: PathBuf::from("/srv/gw"),
        default_in_dir: "/data/in".into(),
        default_out_dir: "/data/out".into(),
        default_tmp_dir: "/data/tmp".into(),
    }
}

async fn server_context(db: &MemoryDb, mut rule: Rule, mut agent: LocalAgent) -> TransferContext {
    db.insert(&mut rule).await.unwrap();
    db.insert(&mut agent).await.unwrap();
    let mut account = LocalAccount::new(agent.id, "toto");
    db.insert(&mut account).await.unwrap();
    let mut transfer = Transfer::server(rule.id, account.id, "report.csv");
    db.insert(&mut transfer).await.unwrap();

    let mut ctx = resolve_context(db.reader(), transfer.id, &gateway_paths())
        .await
        .unwrap();
    resolve_path(&mut ctx);
    ctx
}

async fn client_context(db: &MemoryDb, mut rule: Rule) -> TransferContext {
    db.insert(&mut rule).await.unwrap();
    let mut partner = RemoteAgent::new("partner", "sftp");
    db.insert(&mut partner).await.unwrap();
    let mut account = RemoteAccount::new(partner.id, "titi");
    db.insert(&mut account).await.unwrap();
    let mut client = Client::new("sftp_client", "sftp");
    db.insert(&mut client).await.unwrap();
    let mut transfer = Transfer::client(rule.id, account.id, client.id, "report.csv");
    db.insert(&mut transfer).await.unwrap();

    let mut ctx = resolve_context(db.reader(), transfer.id, &gateway_paths())
        .await
        .unwrap();
    resolve_path(&mut ctx);
    ctx
}

#[tokio::test]
async fn server_send_without_overrides_uses_default_out_dir() {
    let db = MemoryDb::new();
    let ctx = server_context(&db, Rule::new("R", true), LocalAgent::new("server", "sftp")).await;

    assert_eq!(ctx.transfer.remote_path, "report.csv");
    assert_eq!(
        ctx.transfer.local_path,
        PathBuf::from("/srv/gw/data/out").join(&ctx.transfer.remote_path)
    );
    assert_eq!(ctx.transfer.step, TransferStep::Setup);
}

#[tokio::test]
async fn server_receive_prefers_rule_tmp_dir() {
    let db = MemoryDb::new();
    let mut rule = Rule::new("R", false);
    rule.tmp_local_rcv_dir = "rule_tmp".into();
    rule.remote_dir = "/upload/".into();
    let ctx = server_context(&db, rule, LocalAgent::new("server", "sftp")).await;

    assert_eq!(
        ctx.transfer.local_path,
        PathBuf::from("/srv/gw/rule_tmp/report.csv.part")
    );
    assert_eq!(ctx.transfer.remote_path, "/upload/report.csv");
    assert_eq!(
        final_destination(&ctx),
        PathBuf::from("/srv/gw/data/in/report.csv")
    );
}

#[tokio::test]
async fn server_receive_under_agent_root() {
    let db = MemoryDb::new();
    let mut agent = LocalAgent::new("server", "sftp");
    agent.root_dir = "servers/s1".into();
    let ctx = server_context(&db, Rule::new("R", false), agent).await;

    assert_eq!(
        ctx.transfer.local_path,
        PathBuf::from("/srv/gw/servers/s1/work/report.csv.part")
    );
    assert_eq!(
        final_destination(&ctx),
        PathBuf::from("/srv/gw/servers/s1/in/report.csv")
    );
}

#[tokio::test]
async fn client_send_reads_from_default_out_dir() {
    let db = MemoryDb::new();
    let ctx = client_context(&db, Rule::new("R", true)).await;

    assert!(!ctx.is_server());
    assert_eq!(
        ctx.transfer.local_path,
        PathBuf::from("/srv/gw/data/out/report.csv")
    );
}

#[tokio::test]
async fn client_receive_writes_to_default_tmp_dir() {
    let db = MemoryDb::new();
    let ctx = client_context(&db, Rule::new("R", false)).await;

    assert_eq!(
        ctx.transfer.local_path,
        PathBuf::from("/srv/gw/data/tmp/report.csv.part")
    );
}

#[tokio::test]
async fn resumed_transfer_keeps_its_paths() {
    let db = MemoryDb::new();
    let mut ctx = server_context(&db, Rule::new("R", true), LocalAgent::new("server", "sftp")).await;
    let first = ctx.transfer.local_path.clone();

    ctx.paths.gateway_home = PathBuf::from("/elsewhere");
    resolve_path(&mut ctx);
    assert_eq!(ctx.transfer.local_path, first);
}

#[tokio::test]
async fn unknown_transfer_is_an_internal_error() {
    let db = MemoryDb::new();
    let err = resolve_context(db.reader(), 404, &gateway_paths())
        .await
        .unwrap_err();
    assert_eq!(err.code, mft_gateway::model::TransferErrorCode::Internal);
}
