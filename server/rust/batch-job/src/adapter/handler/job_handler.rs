use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::JobApiError;
use super::AppState;
use crate::domain::entity::batch_job::{
    BatchJob, EntityType, JobKind, JobParameters, JobParametersPatch, JobResults, JobStatus,
};
use crate::domain::repository::JobListParams;
use crate::usecase::{
    CreateJobInput, EntityProgress, ProgressSummary, ResumeJobInput, ResumeOutcome,
    TimelineEntry,
};

// --- Request / Response DTOs ---

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    /// IMPORT / SYNC
    pub job_kind: String,
    pub entity_type: String,
    pub tenant_id: String,
    pub credential_ref: String,
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub update_existing: bool,
    #[serde(default)]
    pub only_selected: bool,
    #[serde(default)]
    pub selected_ids: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct ResumeJobRequest {
    /// 省略時は保存済みの processed から再開する。
    pub resume_from_index: Option<u64>,
    pub parameters: Option<JobParametersPatch>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ResumeAllJobsRequest {
    pub tenant_id: String,
    /// 空の場合は全エンティティ種別。
    #[serde(default)]
    pub entity_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub tenant_id: Option<String>,
    /// カンマ区切りで複数指定できる。
    pub status: Option<String>,
    pub entity_type: Option<String>,
    pub job_kind: Option<String>,
    #[serde(default = "default_page")]
    pub page: i32,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
}

fn default_page() -> i32 {
    1
}

fn default_page_size() -> i32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ProgressSummaryQuery {
    pub job_kind: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProgressResponse {
    pub processed: u64,
    pub total: Option<u64>,
    pub percent: f64,
    pub current_entity: Option<String>,
    pub last_progress_update: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub job_id: String,
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub tenant_id: String,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub progress: ProgressResponse,
    pub results: Option<JobResults>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
    pub heartbeat_at: Option<String>,
    /// このインスタンスで実行ループが動いているか。単一ジョブ取得時のみ返す。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
}

fn rfc3339(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339())
}

impl From<BatchJob> for JobResponse {
    fn from(job: BatchJob) -> Self {
        let percent = job.progress.percent();
        Self {
            job_id: job.id.to_string(),
            job_kind: job.job_kind,
            entity_type: job.entity_type,
            tenant_id: job.tenant_id,
            status: job.status,
            parameters: job.parameters,
            progress: ProgressResponse {
                processed: job.progress.processed,
                total: job.progress.total,
                percent,
                current_entity: job.progress.current_entity,
                last_progress_update: rfc3339(job.progress.last_progress_update),
            },
            results: job.results,
            error: job.error,
            created_at: job.created_at.to_rfc3339(),
            started_at: rfc3339(job.started_at),
            paused_at: rfc3339(job.paused_at),
            completed_at: rfc3339(job.completed_at),
            updated_at: job.updated_at.to_rfc3339(),
            heartbeat_at: rfc3339(job.heartbeat_at),
            is_live: None,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobResponse>,
    pub pagination: PaginationResponse,
    /// ステータス以外のフィルタを適用した範囲でのステータス別件数。
    pub counts_by_status: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PaginationResponse {
    pub total_count: i64,
    pub page: i32,
    pub page_size: i32,
    pub has_next: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ResumeOutcomeResponse {
    pub job_id: String,
    pub entity_type: EntityType,
    pub resumed: bool,
    pub error: Option<String>,
}

impl From<ResumeOutcome> for ResumeOutcomeResponse {
    fn from(outcome: ResumeOutcome) -> Self {
        Self {
            job_id: outcome.job_id.to_string(),
            entity_type: outcome.entity_type,
            resumed: outcome.is_resumed(),
            error: outcome.error,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ResumeAllJobsResponse {
    pub resumed: usize,
    pub failed: usize,
    pub outcomes: Vec<ResumeOutcomeResponse>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EntityProgressResponse {
    pub entity_type: EntityType,
    pub selected: bool,
    pub latest_job_id: Option<String>,
    pub job_kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub processed: u64,
    pub total: Option<u64>,
    pub completion_percent: f64,
    pub selected_ids: Option<usize>,
}

impl From<EntityProgress> for EntityProgressResponse {
    fn from(p: EntityProgress) -> Self {
        Self {
            entity_type: p.entity_type,
            selected: p.selected,
            latest_job_id: p.latest_job_id.map(|id| id.to_string()),
            job_kind: p.job_kind,
            status: p.status,
            processed: p.processed,
            total: p.total,
            completion_percent: p.completion_percent,
            selected_ids: p.selected_ids,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TimelineEntryResponse {
    pub job_id: String,
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub status: JobStatus,
    pub started_at: String,
    pub paused_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<TimelineEntry> for TimelineEntryResponse {
    fn from(t: TimelineEntry) -> Self {
        Self {
            job_id: t.job_id.to_string(),
            job_kind: t.job_kind,
            entity_type: t.entity_type,
            status: t.status,
            started_at: t.started_at.to_rfc3339(),
            paused_at: rfc3339(t.paused_at),
            completed_at: rfc3339(t.completed_at),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProgressSummaryResponse {
    pub tenant_id: String,
    pub selection_percent: f64,
    pub completion_percent: f64,
    pub entities: Vec<EntityProgressResponse>,
    pub timeline: Vec<TimelineEntryResponse>,
}

impl From<ProgressSummary> for ProgressSummaryResponse {
    fn from(s: ProgressSummary) -> Self {
        Self {
            tenant_id: s.tenant_id,
            selection_percent: s.selection_percent,
            completion_percent: s.completion_percent,
            entities: s.entities.into_iter().map(Into::into).collect(),
            timeline: s.timeline.into_iter().map(Into::into).collect(),
        }
    }
}

/// カンマ区切りの値を解析する。空要素は無視する。
fn parse_list<T>(
    raw: Option<&str>,
    parse: impl Fn(&str) -> anyhow::Result<T>,
) -> Result<Vec<T>, JobApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse(s).map_err(|e| JobApiError::Validation(e.to_string())))
        .collect()
}

fn parse_job_id(raw: &str) -> Result<Uuid, JobApiError> {
    Uuid::parse_str(raw).map_err(|_| JobApiError::Validation(format!("invalid job_id: {raw}")))
}

// --- Handlers ---

#[utoipa::path(get, path = "/healthz", responses((status = 200, description = "Health check OK")))]
pub async fn healthz() -> &'static str {
    "ok"
}

#[utoipa::path(get, path = "/readyz", responses((status = 200, description = "Ready")))]
pub async fn readyz() -> &'static str {
    "ok"
}

#[utoipa::path(get, path = "/metrics", responses((status = 200, description = "Prometheus metrics")))]
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.gather_metrics()
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = JobResponse),
        (status = 400, description = "Validation error or unsupported operation"),
        (status = 403, description = "Credential not active for tenant"),
        (status = 409, description = "Active job already exists"),
        (status = 502, description = "External data source unreachable"),
    )
)]
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), JobApiError> {
    let job_kind = JobKind::from_str_value(&req.job_kind)
        .map_err(|e| JobApiError::Validation(e.to_string()))?;
    let entity_type = EntityType::from_str_value(&req.entity_type)
        .map_err(|e| JobApiError::Validation(e.to_string()))?;

    let job = state
        .create_job_uc
        .execute(CreateJobInput {
            job_kind,
            entity_type,
            tenant_id: req.tenant_id,
            credential_ref: req.credential_ref,
            batch_size: req.batch_size,
            update_existing: req.update_existing,
            only_selected: req.only_selected,
            selected_ids: req.selected_ids,
            dry_run: req.dry_run,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    params(
        ("tenant_id" = Option<String>, Query, description = "Filter by tenant"),
        ("status" = Option<String>, Query, description = "Comma separated statuses"),
        ("entity_type" = Option<String>, Query, description = "Comma separated entity types"),
        ("job_kind" = Option<String>, Query, description = "IMPORT or SYNC"),
        ("page" = Option<i32>, Query, description = "Page number"),
        ("page_size" = Option<i32>, Query, description = "Page size"),
    ),
    responses(
        (status = 200, description = "Job list", body = ListJobsResponse),
        (status = 400, description = "Invalid filter"),
    )
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, JobApiError> {
    let params = JobListParams {
        tenant_id: query.tenant_id.filter(|t| !t.is_empty()),
        statuses: parse_list(query.status.as_deref(), JobStatus::from_str_value)?,
        entity_types: parse_list(query.entity_type.as_deref(), EntityType::from_str_value)?,
        job_kind: query
            .job_kind
            .as_deref()
            .map(JobKind::from_str_value)
            .transpose()
            .map_err(|e| JobApiError::Validation(e.to_string()))?,
        page: query.page,
        page_size: query.page_size,
    };

    let page = state.list_jobs_uc.execute(params).await?;
    let has_next = page.has_next();

    let mut counts_by_status: BTreeMap<String, i64> = JobStatus::ALL
        .iter()
        .map(|s| (s.to_string(), 0))
        .collect();
    for (status, count) in page.counts_by_status {
        counts_by_status.insert(status.to_string(), count);
    }

    Ok(Json(ListJobsResponse {
        jobs: page.jobs.into_iter().map(JobResponse::from).collect(),
        pagination: PaginationResponse {
            total_count: page.total_count,
            page: page.page,
            page_size: page.page_size,
            has_next,
        },
        counts_by_status,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job detail", body = JobResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, JobApiError> {
    let id = parse_job_id(&job_id)?;
    let view = state
        .get_job_uc
        .execute(id)
        .await?
        .ok_or_else(|| JobApiError::NotFound(format!("batch job not found: {id}")))?;

    let mut response = JobResponse::from(view.job);
    response.is_live = Some(view.is_live);
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/cancel",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job cancelled", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not active"),
    )
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, JobApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state.cancel_job_uc.execute(id).await?;
    Ok(Json(job.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/pause",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job paused", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not running"),
    )
)]
pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, JobApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state.pause_job_uc.execute(id).await?;
    Ok(Json(job.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/resume",
    params(("job_id" = String, Path, description = "Job ID")),
    request_body = ResumeJobRequest,
    responses(
        (status = 202, description = "Job resumed", body = JobResponse),
        (status = 400, description = "Invalid resume index or parameters"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job is not resumable"),
    )
)]
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<ResumeJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), JobApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .resume_job_uc
        .execute(ResumeJobInput {
            job_id: id,
            resume_from_index: req.resume_from_index,
            parameters: req.parameters,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/resume-all",
    request_body = ResumeAllJobsRequest,
    responses(
        (status = 200, description = "Resume results per job", body = ResumeAllJobsResponse),
        (status = 400, description = "Validation error"),
    )
)]
pub async fn resume_all_jobs(
    State(state): State<AppState>,
    Json(req): Json<ResumeAllJobsRequest>,
) -> Result<Json<ResumeAllJobsResponse>, JobApiError> {
    let entity_types = req
        .entity_types
        .iter()
        .map(|s| EntityType::from_str_value(s))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(|e| JobApiError::Validation(e.to_string()))?;

    let outcomes = state
        .resume_all_jobs_uc
        .execute(&req.tenant_id, entity_types)
        .await?;
    let resumed = outcomes.iter().filter(|o| o.is_resumed()).count();

    Ok(Json(ResumeAllJobsResponse {
        resumed,
        failed: outcomes.len() - resumed,
        outcomes: outcomes.into_iter().map(Into::into).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants/{tenant_id}/progress",
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        ("job_kind" = Option<String>, Query, description = "IMPORT or SYNC"),
    ),
    responses(
        (status = 200, description = "Progress summary", body = ProgressSummaryResponse),
    )
)]
pub async fn progress_summary(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ProgressSummaryQuery>,
) -> Result<Json<ProgressSummaryResponse>, JobApiError> {
    let job_kind = query
        .job_kind
        .as_deref()
        .map(JobKind::from_str_value)
        .transpose()
        .map_err(|e| JobApiError::Validation(e.to_string()))?;

    let summary = state
        .progress_summary_uc
        .execute(&tenant_id, job_kind)
        .await?;
    Ok(Json(summary.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_blank_items() {
        let statuses =
            parse_list(Some("paused, running,,"), JobStatus::from_str_value).unwrap();
        assert_eq!(statuses, vec![JobStatus::Paused, JobStatus::Running]);
        assert!(parse_list(None, JobStatus::from_str_value).unwrap().is_empty());
    }

    #[test]
    fn test_parse_list_rejects_unknown_value() {
        let err = parse_list(Some("MERCHANT,BANK"), EntityType::from_str_value).unwrap_err();
        assert!(matches!(err, JobApiError::Validation(msg) if msg.contains("BANK")));
    }

    #[test]
    fn test_job_response_formats_progress() {
        let mut job = BatchJob::new(
            JobKind::Import,
            EntityType::Merchant,
            "tenant-1".to_string(),
            crate::test_support::make_parameters("acme", 20),
        );
        job.progress.processed = 20;
        job.progress.total = Some(80);

        let response = JobResponse::from(job.clone());
        assert_eq!(response.job_id, job.id.to_string());
        assert!((response.progress.percent - 25.0).abs() < f64::EPSILON);
        assert!(response.started_at.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["entity_type"], "MERCHANT");
        assert!(json.get("is_live").is_none());
    }
}
