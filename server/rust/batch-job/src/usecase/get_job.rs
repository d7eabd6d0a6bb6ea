use std::sync::Arc;

use uuid::Uuid;

use crate::domain::entity::batch_job::BatchJob;
use crate::domain::repository::BatchJobRepository;
use crate::infrastructure::run_registry::RunRegistry;

/// JobView はジョブと、このプロセスで実行ループが生きているかどうか。
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: BatchJob,
    pub is_live: bool,
}

/// GetJobUseCase はジョブ詳細取得を担う。
pub struct GetJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
}

impl GetJobUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>, run_registry: Arc<dyn RunRegistry>) -> Self {
        Self {
            job_repo,
            run_registry,
        }
    }

    pub async fn execute(&self, job_id: Uuid) -> anyhow::Result<Option<JobView>> {
        let job = self.job_repo.find_by_id(job_id).await?;
        Ok(job.map(|job| JobView {
            is_live: self.run_registry.is_live(job_id),
            job,
        }))
    }
}
