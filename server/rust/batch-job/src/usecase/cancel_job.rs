use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, TransitionError};
use crate::domain::repository::BatchJobRepository;
use crate::infrastructure::run_registry::RunRegistry;

/// 実行ループとの競合で compare-and-set が外れた場合の再試行回数。
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CancelJobError {
    #[error("batch job not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    StatusMismatch(#[from] TransitionError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// CancelJobUseCase はジョブのキャンセルを担う。
/// 実行中のループにはラッチで通知し、ステータスは永続化ストアで確定させる。
pub struct CancelJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
}

impl CancelJobUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>, run_registry: Arc<dyn RunRegistry>) -> Self {
        Self {
            job_repo,
            run_registry,
        }
    }

    pub async fn execute(&self, job_id: Uuid) -> Result<BatchJob, CancelJobError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self
                .job_repo
                .find_by_id(job_id)
                .await?
                .ok_or(CancelJobError::NotFound(job_id))?;
            let expected = job.status;
            job.cancel()?;

            if self.job_repo.update_if_status(&job, &[expected]).await? {
                // ラッチは永続化の確定後に立てる
                let signalled = self.run_registry.signal_cancel(job_id);
                info!(
                    job_id = %job_id,
                    previous = %expected,
                    live_loop = signalled,
                    "batch job cancelled"
                );
                return Ok(job);
            }
        }
        Err(anyhow::anyhow!("batch job {} kept changing state during cancel", job_id).into())
    }
}
