pub mod error;
pub mod job_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::usecase::{
    CancelJobUseCase, CreateJobUseCase, GetJobUseCase, ListJobsUseCase, PauseJobUseCase,
    ProgressSummaryUseCase, ResumeAllJobsUseCase, ResumeJobUseCase,
};

/// AppState はアプリケーション全体の共有状態を表す。
#[derive(Clone)]
pub struct AppState {
    pub create_job_uc: Arc<CreateJobUseCase>,
    pub get_job_uc: Arc<GetJobUseCase>,
    pub list_jobs_uc: Arc<ListJobsUseCase>,
    pub cancel_job_uc: Arc<CancelJobUseCase>,
    pub pause_job_uc: Arc<PauseJobUseCase>,
    pub resume_job_uc: Arc<ResumeJobUseCase>,
    pub resume_all_jobs_uc: Arc<ResumeAllJobsUseCase>,
    pub progress_summary_uc: Arc<ProgressSummaryUseCase>,
    pub metrics: Arc<mca_telemetry::metrics::Metrics>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        job_handler::healthz,
        job_handler::readyz,
        job_handler::metrics,
        job_handler::create_job,
        job_handler::list_jobs,
        job_handler::get_job,
        job_handler::cancel_job,
        job_handler::pause_job,
        job_handler::resume_job,
        job_handler::resume_all_jobs,
        job_handler::progress_summary,
    ),
    components(schemas(
        job_handler::CreateJobRequest,
        job_handler::ResumeJobRequest,
        job_handler::ResumeAllJobsRequest,
        job_handler::JobResponse,
        job_handler::ProgressResponse,
        job_handler::ListJobsResponse,
        job_handler::PaginationResponse,
        job_handler::ResumeAllJobsResponse,
        job_handler::ResumeOutcomeResponse,
        job_handler::ProgressSummaryResponse,
        job_handler::EntityProgressResponse,
        job_handler::TimelineEntryResponse,
    )),
)]
struct ApiDoc;

/// REST API ルーターを構築する。
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health / Readiness / Metrics
        .route("/healthz", get(job_handler::healthz))
        .route("/readyz", get(job_handler::readyz))
        .route("/metrics", get(job_handler::metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
        // Batch job endpoints
        .route(
            "/api/v1/jobs",
            post(job_handler::create_job).get(job_handler::list_jobs),
        )
        .route("/api/v1/jobs/resume-all", post(job_handler::resume_all_jobs))
        .route("/api/v1/jobs/{job_id}", get(job_handler::get_job))
        .route("/api/v1/jobs/{job_id}/cancel", post(job_handler::cancel_job))
        .route("/api/v1/jobs/{job_id}/pause", post(job_handler::pause_job))
        .route("/api/v1/jobs/{job_id}/resume", post(job_handler::resume_job))
        .route(
            "/api/v1/tenants/{tenant_id}/progress",
            get(job_handler::progress_summary),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_http_metrics,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_json() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(ApiDoc::openapi())
}

/// ルートテンプレート単位で HTTP リクエストのメトリクスを記録する。
async fn track_http_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_string(), |p| p.as_str().to_string());

    let response = next.run(req).await;
    state.metrics.record_http_request(
        &method,
        &path,
        response.status().as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// ErrorResponse は統一エラーレスポンス。
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

/// ErrorDetail はエラーの補足情報（競合したジョブ ID など）。
#[derive(Debug, serde::Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub reason: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(field: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self::with_details(code, message, vec![])
    }

    pub fn with_details(code: &str, message: &str, details: Vec<ErrorDetail>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                request_id: uuid::Uuid::new_v4().to_string(),
                details,
            },
        }
    }
}
