use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::entity::batch_job::{
    BatchJob, EntityType, JobKind, JobParameters, JobProgress, JobResults, JobStatus,
};
use crate::domain::repository::{BatchJobRepository, JobListParams};

const JOB_COLUMNS: &str = "id, job_kind, entity_type, tenant_id, status, parameters, processed, total, \
    current_entity, last_progress_update, results, error, created_at, started_at, paused_at, \
    completed_at, updated_at, heartbeat_at";

/// BatchJobPostgresRepository はPostgreSQL実装のバッチジョブリポジトリ。
pub struct BatchJobPostgresRepository {
    pool: PgPool,
}

impl BatchJobPostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 一覧系クエリの WHERE 句とバインド値。
struct ListFilter {
    tenant_id: Option<String>,
    statuses: Vec<String>,
    entity_types: Vec<String>,
    job_kind: Option<String>,
}

impl ListFilter {
    fn new(params: &JobListParams, include_status: bool) -> Self {
        Self {
            tenant_id: params.tenant_id.clone(),
            statuses: if include_status {
                params.statuses.iter().map(ToString::to_string).collect()
            } else {
                Vec::new()
            },
            entity_types: params.entity_types.iter().map(ToString::to_string).collect(),
            job_kind: params.job_kind.map(|k| k.to_string()),
        }
    }

    /// WHERE 句と次のバインド番号を返す。
    fn where_clause(&self) -> (String, u32) {
        let mut conditions = Vec::new();
        let mut bind_idx = 1u32;

        if self.tenant_id.is_some() {
            conditions.push(format!("tenant_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if !self.statuses.is_empty() {
            conditions.push(format!("status = ANY(${bind_idx})"));
            bind_idx += 1;
        }
        if !self.entity_types.is_empty() {
            conditions.push(format!("entity_type = ANY(${bind_idx})"));
            bind_idx += 1;
        }
        if self.job_kind.is_some() {
            conditions.push(format!("job_kind = ${bind_idx}"));
            bind_idx += 1;
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (clause, bind_idx)
    }
}

fn to_i64(value: u64) -> anyhow::Result<i64> {
    Ok(i64::try_from(value)?)
}

#[async_trait]
impl BatchJobRepository for BatchJobPostgresRepository {
    async fn create(&self, job: &BatchJob) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch.batch_jobs
                (id, job_kind, entity_type, tenant_id, status, parameters, processed, total,
                 current_entity, last_progress_update, results, error, created_at, started_at,
                 paused_at, completed_at, updated_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id)
        .bind(job.job_kind.to_string())
        .bind(job.entity_type.to_string())
        .bind(&job.tenant_id)
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&job.parameters)?)
        .bind(to_i64(job.progress.processed)?)
        .bind(job.progress.total.map(to_i64).transpose()?)
        .bind(&job.progress.current_entity)
        .bind(job.progress.last_progress_update)
        .bind(job.results.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.paused_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<BatchJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM batch.batch_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, BatchJobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_active(
        &self,
        entity_type: EntityType,
        tenant_id: &str,
    ) -> anyhow::Result<Option<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch.batch_jobs \
             WHERE entity_type = $1 AND tenant_id = $2 AND status IN ('PENDING', 'RUNNING', 'PAUSED') \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, BatchJobRow>(&sql)
            .bind(entity_type.to_string())
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_latest_per_entity_type(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        let sql = format!(
            "SELECT DISTINCT ON (entity_type) {JOB_COLUMNS} FROM batch.batch_jobs \
             WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR job_kind = $2) \
             ORDER BY entity_type, created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, BatchJobRow>(&sql)
            .bind(tenant_id)
            .bind(job_kind.map(|k| k.to_string()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list(&self, params: &JobListParams) -> anyhow::Result<(Vec<BatchJob>, i64)> {
        let filter = ListFilter::new(params, true);
        let (where_clause, bind_idx) = filter.where_clause();

        let count_sql = format!("SELECT COUNT(*) FROM batch.batch_jobs {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(ref tenant_id) = filter.tenant_id {
            count_query = count_query.bind(tenant_id);
        }
        if !filter.statuses.is_empty() {
            count_query = count_query.bind(&filter.statuses);
        }
        if !filter.entity_types.is_empty() {
            count_query = count_query.bind(&filter.entity_types);
        }
        if let Some(ref job_kind) = filter.job_kind {
            count_query = count_query.bind(job_kind);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let page_size = i64::from(params.page_size.max(1));
        let offset = (i64::from(params.page.max(1)) - 1).saturating_mul(page_size);
        let data_sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch.batch_jobs {where_clause} \
             ORDER BY created_at DESC, id LIMIT ${} OFFSET ${}",
            bind_idx,
            bind_idx + 1
        );
        let mut data_query = sqlx::query_as::<_, BatchJobRow>(&data_sql);
        if let Some(ref tenant_id) = filter.tenant_id {
            data_query = data_query.bind(tenant_id);
        }
        if !filter.statuses.is_empty() {
            data_query = data_query.bind(&filter.statuses);
        }
        if !filter.entity_types.is_empty() {
            data_query = data_query.bind(&filter.entity_types);
        }
        if let Some(ref job_kind) = filter.job_kind {
            data_query = data_query.bind(job_kind);
        }
        data_query = data_query.bind(page_size).bind(offset);

        let rows = data_query.fetch_all(&self.pool).await?;
        let jobs = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<anyhow::Result<Vec<BatchJob>>>()?;

        Ok((jobs, total))
    }

    async fn count_by_status(
        &self,
        params: &JobListParams,
    ) -> anyhow::Result<HashMap<JobStatus, i64>> {
        let filter = ListFilter::new(params, false);
        let (where_clause, _) = filter.where_clause();

        let sql = format!(
            "SELECT status, COUNT(*) FROM batch.batch_jobs {where_clause} GROUP BY status"
        );
        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        if let Some(ref tenant_id) = filter.tenant_id {
            query = query.bind(tenant_id);
        }
        if !filter.entity_types.is_empty() {
            query = query.bind(&filter.entity_types);
        }
        if let Some(ref job_kind) = filter.job_kind {
            query = query.bind(job_kind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(status, count)| -> anyhow::Result<(JobStatus, i64)> {
                Ok((JobStatus::from_str_value(&status)?, count))
            })
            .collect()
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch.batch_jobs
            SET processed = $2, total = $3, current_entity = $4, last_progress_update = $5,
                heartbeat_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(to_i64(progress.processed)?)
        .bind(progress.total.map(to_i64).transpose()?)
        .bind(&progress.current_entity)
        .bind(progress.last_progress_update)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_if_status(
        &self,
        job: &BatchJob,
        expected: &[JobStatus],
    ) -> anyhow::Result<bool> {
        let expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
        let result = sqlx::query(
            r#"
            UPDATE batch.batch_jobs
            SET status = $2, parameters = $3,
                processed = CASE WHEN status = 'RUNNING' THEN processed ELSE $4 END,
                total = CASE WHEN status = 'RUNNING' THEN total ELSE $5 END,
                current_entity = CASE WHEN status = 'RUNNING' THEN current_entity ELSE $6 END,
                last_progress_update = CASE WHEN status = 'RUNNING' THEN last_progress_update ELSE $7 END,
                results = $8, error = $9, started_at = $10, paused_at = $11, completed_at = $12,
                heartbeat_at = CASE WHEN status = 'RUNNING' THEN heartbeat_at ELSE $13 END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($14)
            "#,
        )
        .bind(job.id)
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&job.parameters)?)
        .bind(to_i64(job.progress.processed)?)
        .bind(job.progress.total.map(to_i64).transpose()?)
        .bind(&job.progress.current_entity)
        .bind(job.progress.last_progress_update)
        .bind(job.results.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.paused_at)
        .bind(job.completed_at)
        .bind(job.heartbeat_at)
        .bind(&expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch.batch_jobs \
             WHERE status = 'RUNNING' AND COALESCE(heartbeat_at, started_at, created_at) < $1 \
             ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, BatchJobRow>(&sql)
            .bind(heartbeat_before)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// BatchJobRow はDB行からのマッピング用。
#[derive(sqlx::FromRow)]
struct BatchJobRow {
    id: Uuid,
    job_kind: String,
    entity_type: String,
    tenant_id: String,
    status: String,
    parameters: serde_json::Value,
    processed: i64,
    total: Option<i64>,
    current_entity: Option<String>,
    last_progress_update: Option<DateTime<Utc>>,
    results: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    heartbeat_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchJobRow> for BatchJob {
    type Error = anyhow::Error;

    fn try_from(row: BatchJobRow) -> anyhow::Result<Self> {
        let parameters: JobParameters = serde_json::from_value(row.parameters)?;
        let results: Option<JobResults> = row.results.map(serde_json::from_value).transpose()?;
        Ok(BatchJob {
            id: row.id,
            job_kind: JobKind::from_str_value(&row.job_kind)?,
            entity_type: EntityType::from_str_value(&row.entity_type)?,
            tenant_id: row.tenant_id,
            status: JobStatus::from_str_value(&row.status)?,
            parameters,
            progress: JobProgress {
                processed: u64::try_from(row.processed)?,
                total: row.total.map(u64::try_from).transpose()?,
                current_entity: row.current_entity,
                last_progress_update: row.last_progress_update,
            },
            results,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            paused_at: row.paused_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            heartbeat_at: row.heartbeat_at,
        })
    }
}
