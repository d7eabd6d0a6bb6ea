use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::entity::batch_job::JobStatus;
use crate::domain::repository::BatchJobRepository;
use crate::infrastructure::run_registry::RunRegistry;

pub const LEASE_EXPIRED: &str = "lease expired";

/// ReapStaleJobsUseCase はハートビートが途絶えた RUNNING ジョブを FAILED にする。
/// プロセスの異常終了で実行ループを失ったジョブを、オペレーターが再開できる状態に戻す。
pub struct ReapStaleJobsUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
    lease_timeout: Duration,
}

impl ReapStaleJobsUseCase {
    pub fn new(
        job_repo: Arc<dyn BatchJobRepository>,
        run_registry: Arc<dyn RunRegistry>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            job_repo,
            run_registry,
            lease_timeout,
        }
    }

    /// FAILED にしたジョブの ID を返す。
    pub async fn execute(&self) -> anyhow::Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.lease_timeout)?;
        let stale = self.job_repo.find_stale_running(cutoff).await?;

        let mut reaped = Vec::new();
        for mut job in stale {
            // このプロセスで生きているループはハートビートが遅いだけ
            if self.run_registry.is_live(job.id) {
                continue;
            }
            job.fail(LEASE_EXPIRED.to_string())?;
            if self
                .job_repo
                .update_if_status(&job, &[JobStatus::Running])
                .await?
            {
                warn!(
                    job_id = %job.id,
                    entity_type = %job.entity_type,
                    tenant_id = %job.tenant_id,
                    processed = job.progress.processed,
                    "batch job lease expired, marked as failed"
                );
                reaped.push(job.id);
            }
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "stale batch jobs reaped");
        }
        Ok(reaped)
    }
}
