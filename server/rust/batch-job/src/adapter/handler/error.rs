use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use super::{ErrorDetail, ErrorResponse};
use crate::usecase::{
    CancelJobError, CreateJobError, PauseJobError, ResumeAllJobsError, ResumeJobError,
};

/// JobApiError はバッチジョブ API のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum JobApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    TenantRejected(String),

    #[error("{message}")]
    Conflict {
        message: String,
        existing_job_id: Uuid,
    },

    #[error("{0}")]
    StatusMismatch(String),

    #[error("{0}")]
    StillRunning(String),

    #[error("{0}")]
    Connectivity(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for JobApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            JobApiError::Validation(_) => (StatusCode::BAD_REQUEST, "SYS_BATCH_VALIDATION_ERROR"),
            JobApiError::Unsupported(_) => {
                (StatusCode::BAD_REQUEST, "SYS_BATCH_UNSUPPORTED_OPERATION")
            }
            JobApiError::NotFound(_) => (StatusCode::NOT_FOUND, "SYS_BATCH_JOB_NOT_FOUND"),
            JobApiError::TenantRejected(_) => (StatusCode::FORBIDDEN, "SYS_BATCH_TENANT_REJECTED"),
            JobApiError::Conflict { .. } => (StatusCode::CONFLICT, "SYS_BATCH_ACTIVE_JOB_EXISTS"),
            JobApiError::StatusMismatch(_) => (StatusCode::CONFLICT, "SYS_BATCH_STATUS_MISMATCH"),
            JobApiError::StillRunning(_) => (StatusCode::CONFLICT, "SYS_BATCH_LOOP_STILL_RUNNING"),
            JobApiError::Connectivity(_) => {
                (StatusCode::BAD_GATEWAY, "SYS_BATCH_DATA_SOURCE_UNAVAILABLE")
            }
            JobApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SYS_BATCH_INTERNAL_ERROR")
            }
        };

        let message = self.to_string();
        let body = match &self {
            JobApiError::Conflict {
                existing_job_id, ..
            } => ErrorResponse::with_details(
                code,
                &message,
                vec![ErrorDetail::new(
                    "existing_job_id",
                    "active_job_exists",
                    existing_job_id.to_string(),
                )],
            ),
            _ => ErrorResponse::new(code, &message),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CreateJobError> for JobApiError {
    fn from(err: CreateJobError) -> Self {
        match err {
            CreateJobError::Validation(msg) => JobApiError::Validation(msg),
            e @ CreateJobError::Unsupported { .. } => JobApiError::Unsupported(e.to_string()),
            e @ CreateJobError::TenantRejected { .. } => JobApiError::TenantRejected(e.to_string()),
            CreateJobError::Conflict {
                existing_job_id,
                entity_type,
                tenant_id,
            } => JobApiError::Conflict {
                message: format!(
                    "an active {entity_type} job already exists for tenant {tenant_id}"
                ),
                existing_job_id,
            },
            e @ CreateJobError::Connectivity(_) => JobApiError::Connectivity(e.to_string()),
            CreateJobError::Internal(e) => JobApiError::Internal(e.to_string()),
        }
    }
}

impl From<CancelJobError> for JobApiError {
    fn from(err: CancelJobError) -> Self {
        match err {
            e @ CancelJobError::NotFound(_) => JobApiError::NotFound(e.to_string()),
            CancelJobError::StatusMismatch(e) => JobApiError::StatusMismatch(e.to_string()),
            CancelJobError::Internal(e) => JobApiError::Internal(e.to_string()),
        }
    }
}

impl From<PauseJobError> for JobApiError {
    fn from(err: PauseJobError) -> Self {
        match err {
            e @ PauseJobError::NotFound(_) => JobApiError::NotFound(e.to_string()),
            PauseJobError::StatusMismatch(e) => JobApiError::StatusMismatch(e.to_string()),
            PauseJobError::Internal(e) => JobApiError::Internal(e.to_string()),
        }
    }
}

impl From<ResumeJobError> for JobApiError {
    fn from(err: ResumeJobError) -> Self {
        match err {
            e @ ResumeJobError::NotFound(_) => JobApiError::NotFound(e.to_string()),
            ResumeJobError::StatusMismatch(e) => JobApiError::StatusMismatch(e.to_string()),
            e @ ResumeJobError::StillRunning(_) => JobApiError::StillRunning(e.to_string()),
            ResumeJobError::Conflict { existing_job_id } => JobApiError::Conflict {
                message: "another active job exists for the same entity type and tenant"
                    .to_string(),
                existing_job_id,
            },
            ResumeJobError::Validation(msg) => JobApiError::Validation(msg),
            ResumeJobError::Internal(e) => JobApiError::Internal(e.to_string()),
        }
    }
}

impl From<ResumeAllJobsError> for JobApiError {
    fn from(err: ResumeAllJobsError) -> Self {
        match err {
            ResumeAllJobsError::Validation(msg) => JobApiError::Validation(msg),
            ResumeAllJobsError::Internal(e) => JobApiError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for JobApiError {
    fn from(err: anyhow::Error) -> Self {
        JobApiError::Internal(err.to_string())
    }
}
