use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::entity::batch_job::{BatchJob, JobStatus};
use crate::domain::repository::{BatchJobRepository, JobListParams};

/// JobPage は一覧 1 ページ分とステータス別件数。
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<BatchJob>,
    pub total_count: i64,
    pub page: i32,
    pub page_size: i32,
    pub counts_by_status: HashMap<JobStatus, i64>,
}

impl JobPage {
    pub fn has_next(&self) -> bool {
        i64::from(self.page) * i64::from(self.page_size) < self.total_count
    }
}

/// ListJobsUseCase はジョブ一覧取得を担う。
pub struct ListJobsUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
}

impl ListJobsUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>) -> Self {
        Self { job_repo }
    }

    /// パラメータに基づいてジョブ一覧を取得する。ページ番号とサイズは正規化される。
    pub async fn execute(&self, mut params: JobListParams) -> anyhow::Result<JobPage> {
        params.page = params.page.max(1);
        params.page_size = params.page_size.clamp(1, 100);

        let (jobs, total_count) = self.job_repo.list(&params).await?;
        let counts_by_status = self.job_repo.count_by_status(&params).await?;

        Ok(JobPage {
            jobs,
            total_count,
            page: params.page,
            page_size: params.page_size,
            counts_by_status,
        })
    }
}
