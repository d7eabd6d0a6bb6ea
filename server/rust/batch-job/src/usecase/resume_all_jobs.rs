use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::{ResumeJobInput, ResumeJobUseCase};
use crate::domain::entity::batch_job::{EntityType, JobStatus};
use crate::domain::repository::{BatchJobRepository, JobListParams};

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const MAX_PAUSED_PER_TENANT: i32 = EntityType::ALL.len() as i32;

/// ResumeOutcome はジョブ 1 件ごとの再開結果。
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOutcome {
    pub job_id: Uuid,
    pub entity_type: EntityType,
    pub error: Option<String>,
}

impl ResumeOutcome {
    pub fn is_resumed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeAllJobsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// ResumeAllJobsUseCase はテナントの PAUSED ジョブをまとめて再開する。
/// 1 件の失敗で残りの再開を止めない。
pub struct ResumeAllJobsUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    resume_job_uc: Arc<ResumeJobUseCase>,
}

impl ResumeAllJobsUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>, resume_job_uc: Arc<ResumeJobUseCase>) -> Self {
        Self {
            job_repo,
            resume_job_uc,
        }
    }

    /// entity_types が空の場合は全エンティティ種別が対象。
    pub async fn execute(
        &self,
        tenant_id: &str,
        entity_types: Vec<EntityType>,
    ) -> Result<Vec<ResumeOutcome>, ResumeAllJobsError> {
        if tenant_id.trim().is_empty() {
            return Err(ResumeAllJobsError::Validation(
                "tenant_id is required".to_string(),
            ));
        }

        let params = JobListParams {
            tenant_id: Some(tenant_id.to_string()),
            statuses: vec![JobStatus::Paused],
            entity_types,
            // アクティブなジョブは (entity_type, tenant_id) ごとに 1 件まで
            page: 1,
            page_size: MAX_PAUSED_PER_TENANT,
            ..Default::default()
        };
        let (mut paused, _) = self.job_repo.list(&params).await?;
        paused.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));

        let mut outcomes = Vec::with_capacity(paused.len());
        for job in paused {
            let result = self
                .resume_job_uc
                .execute(ResumeJobInput {
                    job_id: job.id,
                    ..Default::default()
                })
                .await;
            let error = match result {
                Ok(_) => None,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to resume batch job");
                    Some(e.to_string())
                }
            };
            outcomes.push(ResumeOutcome {
                job_id: job.id,
                entity_type: job.entity_type,
                error,
            });
        }

        info!(
            tenant_id = %tenant_id,
            resumed = outcomes.iter().filter(|o| o.is_resumed()).count(),
            failed = outcomes.iter().filter(|o| !o.is_resumed()).count(),
            "resume-all finished"
        );
        Ok(outcomes)
    }
}
