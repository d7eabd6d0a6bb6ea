use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::data_source::ExternalDataSource;
use crate::domain::entity::batch_job::{BatchJob, EntityType, JobKind, JobParameters};
use crate::domain::repository::{BatchJobRepository, TenantDirectory};
use crate::domain::service::OperationRegistry;

/// BatchLimits はバッチサイズの既定値と上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            max_batch_size: 1000,
        }
    }
}

impl BatchLimits {
    pub fn validate_batch_size(&self, batch_size: u32) -> Result<(), String> {
        if batch_size == 0 || batch_size > self.max_batch_size {
            return Err(format!(
                "batch_size must be between 1 and {}",
                self.max_batch_size
            ));
        }
        Ok(())
    }
}

/// CreateJobInput はジョブ作成の入力。batch_size が None の場合は既定値を使う。
#[derive(Debug, Clone)]
pub struct CreateJobInput {
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub tenant_id: String,
    pub credential_ref: String,
    pub batch_size: Option<u32>,
    pub update_existing: bool,
    pub only_selected: bool,
    pub selected_ids: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateJobError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{job_kind} is not supported for {entity_type}")]
    Unsupported {
        job_kind: JobKind,
        entity_type: EntityType,
    },
    #[error("credential {credential_ref} is not active for tenant {tenant_id}")]
    TenantRejected {
        tenant_id: String,
        credential_ref: String,
    },
    #[error("an active {entity_type} job already exists for tenant {tenant_id}: {existing_job_id}")]
    Conflict {
        existing_job_id: Uuid,
        entity_type: EntityType,
        tenant_id: String,
    },
    #[error("external data source connection failed: {0}")]
    Connectivity(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// CreateJobUseCase はジョブを PENDING で作成し、実行ループを起動する。
pub struct CreateJobUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
    operations: Arc<OperationRegistry>,
    data_source: Arc<dyn ExternalDataSource>,
    tenant_directory: Arc<dyn TenantDirectory>,
    executor: Arc<super::ExecuteJobUseCase>,
    admission: Arc<Mutex<()>>,
    limits: BatchLimits,
}

impl CreateJobUseCase {
    pub fn new(
        job_repo: Arc<dyn BatchJobRepository>,
        operations: Arc<OperationRegistry>,
        data_source: Arc<dyn ExternalDataSource>,
        tenant_directory: Arc<dyn TenantDirectory>,
        executor: Arc<super::ExecuteJobUseCase>,
        admission: Arc<Mutex<()>>,
        limits: BatchLimits,
    ) -> Self {
        Self {
            job_repo,
            operations,
            data_source,
            tenant_directory,
            executor,
            admission,
            limits,
        }
    }

    fn validate(&self, input: &CreateJobInput) -> Result<JobParameters, CreateJobError> {
        if input.tenant_id.trim().is_empty() {
            return Err(CreateJobError::Validation("tenant_id is required".to_string()));
        }
        if input.credential_ref.trim().is_empty() {
            return Err(CreateJobError::Validation(
                "credential_ref is required".to_string(),
            ));
        }
        let batch_size = input.batch_size.unwrap_or(self.limits.default_batch_size);
        self.limits
            .validate_batch_size(batch_size)
            .map_err(CreateJobError::Validation)?;
        if input.only_selected && input.selected_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(CreateJobError::Validation(
                "selected_ids must not be empty when only_selected is set".to_string(),
            ));
        }

        Ok(JobParameters {
            credential_ref: input.credential_ref.clone(),
            batch_size,
            update_existing: input.update_existing,
            only_selected: input.only_selected,
            selected_ids: input
                .selected_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            dry_run: input.dry_run,
        })
    }

    /// ジョブを作成する。
    /// 入力検証 → オペレーション確認 → テナント確認（SYNC）→ 重複確認 → 接続確認
    /// → admission ロック内で重複の再確認と作成 → 起動。
    pub async fn execute(&self, input: CreateJobInput) -> Result<BatchJob, CreateJobError> {
        let parameters = self.validate(&input)?;

        if !self.operations.supports(input.job_kind, input.entity_type) {
            return Err(CreateJobError::Unsupported {
                job_kind: input.job_kind,
                entity_type: input.entity_type,
            });
        }

        if input.job_kind == JobKind::Sync
            && !self
                .tenant_directory
                .is_active_credential(&input.tenant_id, &parameters.credential_ref)
                .await?
        {
            warn!(
                tenant_id = %input.tenant_id,
                credential_ref = %parameters.credential_ref,
                "sync job rejected by tenant directory"
            );
            return Err(CreateJobError::TenantRejected {
                tenant_id: input.tenant_id,
                credential_ref: parameters.credential_ref,
            });
        }

        // 早期の重複確認。確定はロック内で再確認する
        if let Some(existing) = self
            .job_repo
            .find_active(input.entity_type, &input.tenant_id)
            .await?
        {
            return Err(CreateJobError::Conflict {
                existing_job_id: existing.id,
                entity_type: input.entity_type,
                tenant_id: input.tenant_id,
            });
        }

        // 外部呼び出しは admission ロックの外で行う
        match self
            .data_source
            .test_connection(&parameters.credential_ref)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(CreateJobError::Connectivity(
                    "health check did not succeed".to_string(),
                ))
            }
            Err(e) => return Err(CreateJobError::Connectivity(e.to_string())),
        }

        let _admission = self.admission.lock().await;

        if let Some(existing) = self
            .job_repo
            .find_active(input.entity_type, &input.tenant_id)
            .await?
        {
            return Err(CreateJobError::Conflict {
                existing_job_id: existing.id,
                entity_type: input.entity_type,
                tenant_id: input.tenant_id,
            });
        }

        let job = BatchJob::new(
            input.job_kind,
            input.entity_type,
            input.tenant_id,
            parameters,
        );
        if let Err(e) = self.job_repo.create(&job).await {
            // 他インスタンスが先に登録した場合は一意インデックスで拒否される
            if let Some(existing) = self
                .job_repo
                .find_active(job.entity_type, &job.tenant_id)
                .await?
            {
                warn!(error = %e, existing_job_id = %existing.id, "batch job insert lost to a concurrent create");
                return Err(CreateJobError::Conflict {
                    existing_job_id: existing.id,
                    entity_type: job.entity_type,
                    tenant_id: job.tenant_id,
                });
            }
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            job_kind = %job.job_kind,
            entity_type = %job.entity_type,
            tenant_id = %job.tenant_id,
            batch_size = job.parameters.batch_size,
            "batch job created, launching execution loop"
        );
        self.executor.spawn(job.id, 0);

        Ok(job)
    }
}
