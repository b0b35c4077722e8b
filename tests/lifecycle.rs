//! Transfer lifecycle driven the way a protocol driver would, with a real
//! gateway home on disk.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use mft_gateway::config::{PathsConfig, PipelineConfig};
use mft_gateway::db::{Database, MemoryDb, ReadExt, WriteExt};
use mft_gateway::model::{
    LocalAccount, LocalAgent, Rule, Task, TaskChain, Transfer, TransferError, TransferErrorCode,
    TransferStatus, TransferStep,
};
use mft_gateway::transfer::state::new_machine;
use mft_gateway::transfer::{
    LoggingTaskRunner, Pipeline, PipelineError, PipelineState, TaskRunner, TransferContext,
};

/// Records every task and fails the ones named `REJECT`.
#[derive(Default)]
struct RecordingRunner {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run(&self, task: &Task, _ctx: &TransferContext) -> Result<(), TransferError> {
        self.seen.lock().unwrap().push(task.kind.clone());
        if task.kind == "REJECT" {
            return Err(TransferError::new(
                TransferErrorCode::ExternalOperation,
                "file rejected",
            ));
        }
        Ok(())
    }
}

struct Gateway {
    db: Arc<dyn Database>,
    home: TempDir,
    paths: PathsConfig,
    account: LocalAccount,
}

impl Gateway {
    async fn new() -> Self {
        let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
        let home = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            gateway_home: home.path().to_path_buf(),
            default_in_dir: "in".into(),
            default_out_dir: "out".into(),
            default_tmp_dir: "tmp".into(),
        };

        let mut server = LocalAgent::new("sftp_server", "sftp");
        db.insert(&mut server).await.unwrap();
        let mut account = LocalAccount::new(server.id, "partner");
        db.insert(&mut account).await.unwrap();

        Self {
            db,
            home,
            paths,
            account,
        }
    }

    async fn rule(&self, name: &str, is_send: bool, tasks: &[(TaskChain, &str)]) -> Rule {
        let mut rule = Rule::new(name, is_send);
        self.db.insert(&mut rule).await.unwrap();
        for (rank, (chain, kind)) in tasks.iter().enumerate() {
            let mut task = Task::new(rule.id, *chain, rank as u32, kind);
            self.db.insert(&mut task).await.unwrap();
        }
        rule
    }

    async fn start(&self, rule: &Rule, file: &str, runner: Arc<dyn TaskRunner>) -> Pipeline {
        let mut transfer = Transfer::server(rule.id, self.account.id, file);
        self.db.insert(&mut transfer).await.unwrap();
        Pipeline::from_transfer_id(
            self.db.clone(),
            transfer.id,
            &self.paths,
            runner,
            &PipelineConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn stored(&self, transfer_id: i64) -> Transfer {
        self.db.get_by_id(transfer_id).await.unwrap()
    }
}

#[test]
fn only_terminal_states_have_ended() {
    let machine = new_machine();
    for next in [
        PipelineState::PreTasks,
        PipelineState::Error,
        PipelineState::InError,
    ] {
        assert!(!machine.has_ended(), "{} is not terminal", machine.current());
        machine.transition(next).unwrap();
    }
    assert!(machine.has_ended());
    assert!(machine.transition(PipelineState::Init).is_err());
    assert_eq!(machine.current(), PipelineState::InError);
}

#[tokio::test]
async fn receive_lands_in_default_in_dir() {
    let gw = Gateway::new().await;
    let rule = gw.rule("upload", false, &[]).await;
    let mut pipeline = gw.start(&rule, "invoice.xml", Arc::new(LoggingTaskRunner)).await;
    let transfer_id = pipeline.handle().transfer_id();

    pipeline.pre_tasks().await.unwrap();
    pipeline.start_data().await.unwrap();
    pipeline.write(b"<invoice/>").await.unwrap();
    pipeline.end_data().await.unwrap();
    pipeline.post_tasks().await.unwrap();
    pipeline.end_transfer().await.unwrap();

    let dest = gw.home.path().join("in/invoice.xml");
    assert_eq!(std::fs::read(&dest).unwrap(), b"<invoice/>");
    assert!(!gw.home.path().join("tmp/invoice.xml.part").exists());

    let stored = gw.stored(transfer_id).await;
    assert_eq!(stored.status, TransferStatus::Done);
    assert_eq!(stored.step, TransferStep::None);
    assert_eq!(stored.local_path, dest);
    assert_eq!(stored.filesize, 10);
}

#[tokio::test]
async fn cancel_from_another_task_while_writing() {
    let gw = Gateway::new().await;
    let rule = gw.rule("upload", false, &[(TaskChain::Error, "ALERT")]).await;
    let runner = Arc::new(RecordingRunner::default());
    let mut pipeline = gw.start(&rule, "big.bin", runner.clone()).await;
    let handle = pipeline.handle();
    let part = pipeline.context().transfer.local_path.clone();

    pipeline.pre_tasks().await.unwrap();
    pipeline.start_data().await.unwrap();
    pipeline.write(&[0u8; 64]).await.unwrap();

    let canceller = handle.clone();
    tokio::spawn(async move { canceller.cancel().await })
        .await
        .unwrap();

    let err = pipeline.write(&[0u8; 64]).await.unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
    assert_eq!(handle.current(), PipelineState::InError);
    assert!(handle.has_ended());
    assert!(!part.exists());
    assert!(runner.seen.lock().unwrap().is_empty(), "signals skip error tasks");

    let stored = gw.stored(handle.transfer_id()).await;
    assert_eq!(stored.status, TransferStatus::Cancelled);
    assert_eq!(stored.error.code, TransferErrorCode::Ok);
}

#[tokio::test]
async fn failing_post_task_runs_error_chain() {
    let gw = Gateway::new().await;
    let rule = gw
        .rule(
            "download",
            true,
            &[(TaskChain::Post, "REJECT"), (TaskChain::Error, "ALERT")],
        )
        .await;
    std::fs::create_dir_all(gw.home.path().join("out")).unwrap();
    std::fs::write(gw.home.path().join("out/orders.csv"), b"id\n1\n").unwrap();

    let runner = Arc::new(RecordingRunner::default());
    let mut pipeline = gw.start(&rule, "orders.csv", runner.clone()).await;
    let transfer_id = pipeline.handle().transfer_id();

    pipeline.pre_tasks().await.unwrap();
    pipeline.start_data().await.unwrap();
    let mut buf = [0u8; 32];
    while pipeline.read(&mut buf).await.unwrap() > 0 {}
    pipeline.end_data().await.unwrap();

    let err = pipeline.post_tasks().await.unwrap_err();
    assert_eq!(err.code(), "EXTERNAL_OPERATION");
    assert_eq!(pipeline.current(), PipelineState::InError);
    assert_eq!(*runner.seen.lock().unwrap(), ["REJECT", "ALERT"]);

    let stored = gw.stored(transfer_id).await;
    assert_eq!(stored.status, TransferStatus::Error);
    assert_eq!(stored.step, TransferStep::PostTasks);
    assert_eq!(stored.error.code, TransferErrorCode::ExternalOperation);
    assert_eq!(stored.progress, 5);
}
