use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, JobStatus, TransitionError};
use crate::domain::repository::BatchJobRepository;
use crate::infrastructure::run_registry::RunRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PauseJobError {
    #[error("batch job not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    StatusMismatch(#[from] TransitionError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// PauseJobUseCase は RUNNING のジョブを一時停止する。進捗は保持される。
pub struct PauseJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
}

impl PauseJobUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>, run_registry: Arc<dyn RunRegistry>) -> Self {
        Self {
            job_repo,
            run_registry,
        }
    }

    pub async fn execute(&self, job_id: Uuid) -> Result<BatchJob, PauseJobError> {
        let mut job = self
            .job_repo
            .find_by_id(job_id)
            .await?
            .ok_or(PauseJobError::NotFound(job_id))?;
        job.pause()?;

        if !self
            .job_repo
            .update_if_status(&job, &[JobStatus::Running])
            .await?
        {
            // 実行ループが先に最終状態を書いた
            let current = self
                .job_repo
                .find_by_id(job_id)
                .await?
                .ok_or(PauseJobError::NotFound(job_id))?;
            return Err(TransitionError {
                from: current.status,
                action: "pause",
            }
            .into());
        }
        // ラッチは永続化の確定後に立てる
        let signalled = self.run_registry.signal_pause(job_id);

        info!(
            job_id = %job_id,
            processed = job.progress.processed,
            live_loop = signalled,
            "batch job paused"
        );
        Ok(job)
    }
}
