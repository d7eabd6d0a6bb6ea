use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mca_telemetry::metrics::Metrics;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, JobProgress, JobStatus};
use crate::domain::repository::BatchJobRepository;
use crate::domain::service::{
    EntityOperation, InterruptKind, OperationContext, OperationError, OperationRegistry,
    OperationSummary, ProgressReporter,
};
use crate::infrastructure::run_registry::{RunControl, RunGuard, RunRegistry, RunRegistryError};

/// ExecuteJobUseCase はバッチジョブ 1 件の実行ループを担う。
///
/// ループはチェックポイントごとにプロセス内のラッチと永続化されたステータスの
/// 両方を確認し、進捗を書き込み、終了時にジョブを最終状態へ確定させる。
/// 最終状態の書き込みは期待ステータスに対する compare-and-set で行うため、
/// 外部からのキャンセルが完了で上書きされることはない。
pub struct ExecuteJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
    operations: Arc<OperationRegistry>,
    metrics: Option<Arc<Metrics>>,
}

impl ExecuteJobUseCase {
    pub fn new(
        job_repo: Arc<dyn BatchJobRepository>,
        run_registry: Arc<dyn RunRegistry>,
        operations: Arc<OperationRegistry>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            job_repo,
            run_registry,
            operations,
            metrics,
        }
    }

    /// 実行ループをバックグラウンドタスクとして起動する。
    pub fn spawn(self: &Arc<Self>, job_id: Uuid, resume_from_index: u64) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            match executor.run(job_id, resume_from_index).await {
                Ok(status) => {
                    debug!(job_id = %job_id, status = %status, "execution loop exited");
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "execution loop aborted");
                }
            }
        })
    }

    /// ジョブを実行し、ループ終了時点のステータスを返す。
    pub async fn run(&self, job_id: Uuid, resume_from_index: u64) -> anyhow::Result<JobStatus> {
        let control = match self.run_registry.register(job_id) {
            Ok(control) => control,
            Err(e @ RunRegistryError::AlreadyRegistered(_)) => return Err(e.into()),
            Err(e @ RunRegistryError::AtCapacity(_)) => {
                error!(job_id = %job_id, error = %e, "cannot schedule batch job");
                return self.fail_unscheduled(job_id, &e.to_string()).await;
            }
        };
        let _guard = RunGuard::new(Arc::clone(&self.run_registry), job_id);

        let Some(mut job) = self.job_repo.find_by_id(job_id).await? else {
            anyhow::bail!("batch job not found: {}", job_id);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            info!(job_id = %job_id, status = %job.status, "batch job is not runnable, skipping");
            return Ok(job.status);
        }

        let Some(operation) = self.operations.get(job.job_kind, job.entity_type) else {
            let reason = format!(
                "no operation registered for {} {}",
                job.job_kind, job.entity_type
            );
            return self.fail_unscheduled(job_id, &reason).await;
        };

        if job.status == JobStatus::Pending {
            job.start()?;
            if !self
                .job_repo
                .update_if_status(&job, &[JobStatus::Pending])
                .await?
            {
                let current = self.current_status(job_id).await?;
                info!(job_id = %job_id, status = %current, "batch job changed state before start");
                return Ok(current);
            }
        }

        info!(
            job_id = %job_id,
            job_kind = %job.job_kind,
            entity_type = %job.entity_type,
            tenant_id = %job.tenant_id,
            resume_from_index,
            "batch job running"
        );
        let kind_label = job.job_kind.to_string();
        let entity_label = job.entity_type.to_string();
        if let Some(metrics) = &self.metrics {
            metrics.record_job_started(&kind_label, &entity_label);
        }

        let outcome = self
            .drive(&mut job, operation.as_ref(), &control, resume_from_index)
            .await;
        let finalized = self.finalize(job_id, outcome).await;

        if let Some(metrics) = &self.metrics {
            let status = finalized
                .as_ref()
                .map_or_else(|_| "UNKNOWN".to_string(), ToString::to_string);
            metrics.record_job_finished(&kind_label, &entity_label, &status);
        }
        finalized
    }

    /// total の確定、着手前の中断確認、オペレーション実行までを行う。
    async fn drive(
        &self,
        job: &mut BatchJob,
        operation: &dyn EntityOperation,
        control: &RunControl,
        resume_from_index: u64,
    ) -> Result<OperationSummary, OperationError> {
        let total = if let Some(total) = job.progress.total {
            total
        } else {
            let total = operation.count(&job.tenant_id, &job.parameters).await?;
            job.progress = JobProgress {
                processed: resume_from_index.min(total),
                total: Some(total),
                current_entity: None,
                last_progress_update: Some(Utc::now()),
            };
            if !self.job_repo.update_progress(job.id, &job.progress).await? {
                let kind = detect_interruption(self.job_repo.as_ref(), control, job.id)
                    .await?
                    .unwrap_or(InterruptKind::Cancelled);
                return Err(OperationError::Interrupted(kind));
            }
            info!(job_id = %job.id, total, "batch job total counted");
            total
        };
        let resume_from_index = resume_from_index.min(total);

        if let Some(kind) = detect_interruption(self.job_repo.as_ref(), control, job.id).await? {
            return Err(OperationError::Interrupted(kind));
        }

        let ctx = OperationContext {
            job_id: job.id,
            job_kind: job.job_kind,
            entity_type: job.entity_type,
            tenant_id: job.tenant_id.clone(),
            parameters: job.parameters.clone(),
            resume_from_index,
            total,
        };
        let reporter = CheckpointReporter {
            job_repo: self.job_repo.as_ref(),
            control,
            metrics: self.metrics.as_deref(),
            ctx: &ctx,
            checkpoint: AtomicU64::new(resume_from_index),
        };
        operation.run(&ctx, &reporter).await
    }

    /// オペレーションの結果をジョブの最終状態として書き込む。
    async fn finalize(
        &self,
        job_id: Uuid,
        outcome: Result<OperationSummary, OperationError>,
    ) -> anyhow::Result<JobStatus> {
        let Some(mut job) = self.job_repo.find_by_id(job_id).await? else {
            anyhow::bail!("batch job disappeared during execution: {}", job_id);
        };
        let expected = job.status;

        match outcome {
            Ok(summary) => {
                if expected != JobStatus::Running {
                    warn!(
                        job_id = %job_id,
                        status = %expected,
                        "batch job left RUNNING before completion was recorded"
                    );
                    return Ok(expected);
                }
                job.complete(summary.into_results())?;
            }
            Err(OperationError::Interrupted(InterruptKind::Cancelled)) => {
                if !expected.is_active() {
                    return Ok(expected);
                }
                job.cancel()?;
            }
            Err(OperationError::Interrupted(InterruptKind::Paused)) => {
                if expected != JobStatus::Running {
                    return Ok(expected);
                }
                job.pause()?;
            }
            Err(OperationError::Fatal(e)) => {
                error!(job_id = %job_id, error = %format!("{e:#}"), "batch job failed");
                if expected != JobStatus::Running {
                    return Ok(expected);
                }
                job.fail(format!("{e:#}"))?;
            }
        }

        if self.job_repo.update_if_status(&job, &[expected]).await? {
            info!(
                job_id = %job_id,
                status = %job.status,
                processed = job.progress.processed,
                total = ?job.progress.total,
                "batch job finished"
            );
            Ok(job.status)
        } else {
            let current = self.current_status(job_id).await?;
            warn!(
                job_id = %job_id,
                attempted = %job.status,
                status = %current,
                "batch job state changed concurrently, final write skipped"
            );
            Ok(current)
        }
    }

    /// 実行ループを起動できなかったジョブを FAILED にする。
    async fn fail_unscheduled(&self, job_id: Uuid, reason: &str) -> anyhow::Result<JobStatus> {
        let Some(mut job) = self.job_repo.find_by_id(job_id).await? else {
            anyhow::bail!("batch job not found: {}", job_id);
        };
        let expected = job.status;
        if job.fail(reason.to_string()).is_err() {
            return Ok(expected);
        }
        if self.job_repo.update_if_status(&job, &[expected]).await? {
            warn!(job_id = %job_id, reason, "batch job failed before execution");
            Ok(JobStatus::Failed)
        } else {
            self.current_status(job_id).await
        }
    }

    async fn current_status(&self, job_id: Uuid) -> anyhow::Result<JobStatus> {
        self.job_repo
            .find_by_id(job_id)
            .await?
            .map(|job| job.status)
            .ok_or_else(|| anyhow::anyhow!("batch job not found: {}", job_id))
    }
}

/// ラッチまたは永続化ステータスから中断要求を検出する。
/// RUNNING 以外になったジョブは PAUSED を除きすべて停止要求として扱う。
async fn detect_interruption(
    job_repo: &dyn BatchJobRepository,
    control: &RunControl,
    job_id: Uuid,
) -> anyhow::Result<Option<InterruptKind>> {
    if let Some(kind) = control.interrupt() {
        return Ok(Some(kind));
    }
    let status = job_repo.find_by_id(job_id).await?.map(|job| job.status);
    Ok(match status {
        Some(JobStatus::Running) => None,
        Some(JobStatus::Paused) => Some(InterruptKind::Paused),
        _ => Some(InterruptKind::Cancelled),
    })
}

/// CheckpointReporter はオペレーションからの報告を永続化された進捗へ変換する。
struct CheckpointReporter<'a> {
    job_repo: &'a dyn BatchJobRepository,
    control: &'a RunControl,
    metrics: Option<&'a Metrics>,
    ctx: &'a OperationContext,
    checkpoint: AtomicU64,
}

#[async_trait]
impl<'a> ProgressReporter for CheckpointReporter<'a> {
    async fn report(
        &self,
        processed: u64,
        current_entity: Option<String>,
    ) -> Result<(), OperationError> {
        let job_id = self.ctx.job_id;
        if let Some(kind) = detect_interruption(self.job_repo, self.control, job_id).await? {
            debug!(job_id = %job_id, interrupt = %kind, "interruption observed at checkpoint");
            return Err(OperationError::Interrupted(kind));
        }

        let previous = self.checkpoint.load(Ordering::SeqCst);
        let absolute = self
            .ctx
            .resume_from_index
            .saturating_add(processed)
            .min(self.ctx.total)
            .max(previous);
        let progress = JobProgress {
            processed: absolute,
            total: Some(self.ctx.total),
            current_entity,
            last_progress_update: Some(Utc::now()),
        };
        if !self.job_repo.update_progress(job_id, &progress).await? {
            let kind = detect_interruption(self.job_repo, self.control, job_id)
                .await?
                .unwrap_or(InterruptKind::Cancelled);
            return Err(OperationError::Interrupted(kind));
        }
        self.checkpoint.store(absolute, Ordering::SeqCst);

        if let Some(metrics) = self.metrics {
            metrics.record_units_processed(
                &self.ctx.job_kind.to_string(),
                &self.ctx.entity_type.to_string(),
                absolute - previous,
            );
        }
        debug!(job_id = %job_id, processed = absolute, total = self.ctx.total, "checkpoint persisted");
        Ok(())
    }
}
