//! 実行エンジンのシナリオテスト。
//! ユースケースを直接呼び出し、チェックポイントと状態遷移の不変条件を確認する。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use mca_batch_job_server::domain::entity::batch_job::{EntityType, JobKind, JobStatus};
use mca_batch_job_server::domain::repository::BatchJobRepository;
use mca_batch_job_server::domain::service::OperationRegistry;
use mca_batch_job_server::infrastructure::run_registry::RunRegistry;
use mca_batch_job_server::test_support::{
    merchant_records, GateHandle, GatedOperation, TestEngine,
};
use mca_batch_job_server::usecase::{
    CreateJobError, CreateJobInput, ReapStaleJobsUseCase, ResumeJobError, ResumeJobInput,
};

fn merchant_import(tenant_id: &str, batch_size: u32) -> CreateJobInput {
    CreateJobInput {
        job_kind: JobKind::Import,
        entity_type: EntityType::Merchant,
        tenant_id: tenant_id.to_string(),
        credential_ref: "acme".to_string(),
        batch_size: Some(batch_size),
        update_existing: false,
        only_selected: false,
        selected_ids: vec![],
        dry_run: false,
    }
}

fn gated_engine(total: u64) -> (TestEngine, GateHandle) {
    let (operation, gate) = GatedOperation::new(total);
    let mut registry = OperationRegistry::new();
    registry.register(JobKind::Import, EntityType::Merchant, Arc::new(operation));
    (TestEngine::build(Some(registry), Vec::new()), gate)
}

fn assert_monotonic(writes: &[u64], total: u64) {
    assert!(
        writes.windows(2).all(|w| w[0] <= w[1]),
        "checkpoints went backwards: {writes:?}"
    );
    assert!(writes.iter().all(|p| *p <= total), "checkpoint beyond total: {writes:?}");
}

#[tokio::test]
async fn test_import_happy_path_in_three_batches() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(45));

    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 20))
        .await
        .unwrap();
    let done = engine
        .wait_for_status(job.id, &[JobStatus::Completed])
        .await
        .unwrap();

    assert_eq!(done.progress.processed, 45);
    assert_eq!(done.progress.total, Some(45));
    assert_eq!(done.progress.current_entity.as_deref(), Some("m-044"));
    let results = done.results.unwrap();
    assert_eq!(results.created + results.skipped + results.failed, 45);
    assert_eq!(engine.job_repo.progress_writes(job.id), vec![0, 20, 40, 45]);

    engine.wait_until_idle(job.id).await.unwrap();
    assert!(!engine.run_registry.is_live(job.id));
}

#[tokio::test]
async fn test_second_import_skips_existing_records() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(10));

    let first = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 4))
        .await
        .unwrap();
    engine
        .wait_for_status(first.id, &[JobStatus::Completed])
        .await
        .unwrap();

    let second = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 4))
        .await
        .unwrap();
    let done = engine
        .wait_for_status(second.id, &[JobStatus::Completed])
        .await
        .unwrap();
    let results = done.results.unwrap();
    assert_eq!(results.created, 0);
    assert_eq!(results.skipped, 10);
}

#[tokio::test]
async fn test_pause_at_ten_then_resume_at_ten() {
    let (engine, mut gate) = gated_engine(45);
    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 10))
        .await
        .unwrap();

    gate.release(1);
    assert_eq!(gate.next_checkpoint().await.unwrap(), 10);
    engine.state.pause_job_uc.execute(job.id).await.unwrap();
    gate.open();
    engine.wait_until_idle(job.id).await.unwrap();

    let paused = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.progress.processed, 10);
    assert!(paused.paused_at.is_some());

    engine
        .state
        .resume_job_uc
        .execute(ResumeJobInput {
            job_id: job.id,
            resume_from_index: Some(10),
            parameters: None,
        })
        .await
        .unwrap();
    let done = engine
        .wait_for_status(job.id, &[JobStatus::Completed])
        .await
        .unwrap();
    assert_eq!(done.progress.processed, 45);
    assert_eq!(done.started_at, paused.started_at);

    let writes = engine.job_repo.progress_writes(job.id);
    assert_eq!(writes, vec![0, 10, 20, 30, 40, 45]);
    assert_monotonic(&writes, 45);
}

#[tokio::test]
async fn test_cancel_after_two_checkpoints_stops_progress() {
    let (engine, mut gate) = gated_engine(60);
    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 10))
        .await
        .unwrap();

    gate.release(2);
    gate.next_checkpoint().await.unwrap();
    gate.next_checkpoint().await.unwrap();
    engine.state.cancel_job_uc.execute(job.id).await.unwrap();

    gate.open();
    engine.wait_until_idle(job.id).await.unwrap();
    let cancelled = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.progress.processed, 20);
    assert_eq!(engine.job_repo.progress_writes(job.id), vec![0, 10, 20]);

    // 二度目のキャンセルは状態不一致
    assert!(engine.state.cancel_job_uc.execute(job.id).await.is_err());
}

#[tokio::test]
async fn test_cancel_paused_job_without_live_loop_is_durable() {
    let (engine, mut gate) = gated_engine(30);
    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 10))
        .await
        .unwrap();
    gate.release(1);
    gate.next_checkpoint().await.unwrap();
    engine.state.pause_job_uc.execute(job.id).await.unwrap();
    gate.open();
    engine.wait_until_idle(job.id).await.unwrap();

    let cancelled = engine.state.cancel_job_uc.execute(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    let stored = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.progress.processed, 10);

    let err = engine
        .state
        .resume_job_uc
        .execute(ResumeJobInput {
            job_id: job.id,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ResumeJobError::StatusMismatch(_)));
}

#[tokio::test]
async fn test_fatal_error_on_second_batch_marks_failed() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(45));
    engine.data_source.fail_fetch_at_offset(20);

    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 20))
        .await
        .unwrap();
    let failed = engine
        .wait_for_status(job.id, &[JobStatus::Failed])
        .await
        .unwrap();

    assert_eq!(failed.progress.processed, 20);
    assert!(failed.error.is_some());
    assert!(failed.completed_at.is_some());
    engine.wait_until_idle(job.id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_creates_admit_exactly_one() {
    let (engine, gate) = gated_engine(10);
    let uc = engine.state.create_job_uc.clone();

    let attempts = (0..5).map(|_| {
        let uc = uc.clone();
        tokio::spawn(async move { uc.execute(merchant_import("T1", 10)).await })
    });
    let mut created = Vec::new();
    let mut conflicts = Vec::new();
    for handle in attempts.collect::<Vec<_>>() {
        match handle.await.unwrap() {
            Ok(job) => created.push(job.id),
            Err(CreateJobError::Conflict {
                existing_job_id, ..
            }) => conflicts.push(existing_job_id),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(created.len(), 1);
    assert_eq!(conflicts.len(), 4);
    assert!(conflicts.iter().all(|id| *id == created[0]));

    gate.open();
    engine
        .wait_for_status(created[0], &[JobStatus::Completed])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_durable_cancel_from_another_instance_is_observed() {
    let (engine, mut gate) = gated_engine(40);
    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 10))
        .await
        .unwrap();
    gate.release(1);
    gate.next_checkpoint().await.unwrap();

    // 別インスタンスが永続化ストアだけを更新した状態（ラッチは立たない）
    let mut remote = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    remote.cancel().unwrap();
    assert!(engine
        .job_repo
        .update_if_status(&remote, &[JobStatus::Running])
        .await
        .unwrap());

    gate.open();
    engine.wait_until_idle(job.id).await.unwrap();
    let stored = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.progress.processed, 10);
    assert_eq!(engine.job_repo.progress_writes(job.id), vec![0, 10]);
}

#[tokio::test]
async fn test_orphaned_running_job_is_reaped_and_resumable() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(30));

    // 前回プロセスのループが消えた RUNNING ジョブ
    let job = engine
        .state
        .create_job_uc
        .execute(merchant_import("T1", 10))
        .await
        .unwrap();
    engine
        .wait_for_status(job.id, &[JobStatus::Completed])
        .await
        .unwrap();
    let mut orphan = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    orphan.status = JobStatus::Running;
    orphan.results = None;
    orphan.completed_at = None;
    orphan.progress.processed = 10;
    orphan.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(30));
    assert!(engine
        .job_repo
        .update_if_status(&orphan, &[JobStatus::Completed])
        .await
        .unwrap());

    let reaper = ReapStaleJobsUseCase::new(
        engine.job_repo.clone(),
        engine.run_registry.clone(),
        Duration::from_secs(60),
    );
    assert_eq!(reaper.execute().await.unwrap(), vec![job.id]);
    let failed = engine.job_repo.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("lease expired"));

    engine
        .state
        .resume_job_uc
        .execute(ResumeJobInput {
            job_id: job.id,
            ..Default::default()
        })
        .await
        .unwrap();
    let done = engine
        .wait_for_status(job.id, &[JobStatus::Completed])
        .await
        .unwrap();
    assert_eq!(done.progress.processed, 30);
    let writes = engine.job_repo.progress_writes(job.id);
    assert_eq!(&writes[writes.len() - 2..], &[20, 30]);
}
