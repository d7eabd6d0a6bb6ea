use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{BatchLimits, ExecuteJobUseCase};
use crate::domain::entity::batch_job::{BatchJob, JobParametersPatch, TransitionError};
use crate::domain::repository::BatchJobRepository;
use crate::infrastructure::run_registry::RunRegistry;

/// ResumeJobInput は再開の入力。resume_from_index が None の場合は保存済みのチェックポイントから再開する。
#[derive(Debug, Clone, Default)]
pub struct ResumeJobInput {
    pub job_id: Uuid,
    pub resume_from_index: Option<u64>,
    pub parameters: Option<JobParametersPatch>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeJobError {
    #[error("batch job not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    StatusMismatch(#[from] TransitionError),
    #[error("previous execution loop of batch job {0} has not exited yet")]
    StillRunning(Uuid),
    #[error("another active job exists for the same entity type and tenant: {existing_job_id}")]
    Conflict { existing_job_id: Uuid },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// ResumeJobUseCase は PAUSED / FAILED のジョブを再開する。
pub struct ResumeJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
    executor: Arc<ExecuteJobUseCase>,
    admission: Arc<Mutex<()>>,
    limits: BatchLimits,
}

impl ResumeJobUseCase {
    pub fn new(
        job_repo: Arc<dyn BatchJobRepository>,
        run_registry: Arc<dyn RunRegistry>,
        executor: Arc<ExecuteJobUseCase>,
        admission: Arc<Mutex<()>>,
        limits: BatchLimits,
    ) -> Self {
        Self {
            job_repo,
            run_registry,
            executor,
            admission,
            limits,
        }
    }

    pub async fn execute(&self, input: ResumeJobInput) -> Result<BatchJob, ResumeJobError> {
        let job_id = input.job_id;
        if let Some(batch_size) = input.parameters.as_ref().and_then(|p| p.batch_size) {
            self.limits
                .validate_batch_size(batch_size)
                .map_err(ResumeJobError::Validation)?;
        }

        let _admission = self.admission.lock().await;

        let mut job = self
            .job_repo
            .find_by_id(job_id)
            .await?
            .ok_or(ResumeJobError::NotFound(job_id))?;
        if !job.status.is_resumable() {
            return Err(TransitionError {
                from: job.status,
                action: "resume",
            }
            .into());
        }
        if self.run_registry.is_live(job_id) {
            return Err(ResumeJobError::StillRunning(job_id));
        }

        let resume_from_index = input.resume_from_index.unwrap_or(job.progress.processed);
        if let Some(total) = job.progress.total {
            if resume_from_index > total {
                return Err(ResumeJobError::Validation(format!(
                    "resume_from_index {resume_from_index} exceeds total {total}"
                )));
            }
        }

        if let Some(active) = self
            .job_repo
            .find_active(job.entity_type, &job.tenant_id)
            .await?
        {
            if active.id != job_id {
                return Err(ResumeJobError::Conflict {
                    existing_job_id: active.id,
                });
            }
        }

        let expected = job.status;
        job.resume(resume_from_index, input.parameters.as_ref())?;
        if !self.job_repo.update_if_status(&job, &[expected]).await? {
            let current = self
                .job_repo
                .find_by_id(job_id)
                .await?
                .ok_or(ResumeJobError::NotFound(job_id))?;
            return Err(TransitionError {
                from: current.status,
                action: "resume",
            }
            .into());
        }

        info!(
            job_id = %job_id,
            previous = %expected,
            resume_from_index,
            total = ?job.progress.total,
            "batch job resumed, launching execution loop"
        );
        self.executor.spawn(job_id, resume_from_index);
        Ok(job)
    }
}
