//! REST API統合テスト（インメモリリポジトリ使用）
//!
//! tower::ServiceExt + oneshot でルーターを直接呼び出す。

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use mca_batch_job_server::adapter::handler;
use mca_batch_job_server::domain::entity::batch_job::{EntityType, JobKind, JobStatus};
use mca_batch_job_server::domain::service::OperationRegistry;
use mca_batch_job_server::infrastructure::config::TenantConfig;
use mca_batch_job_server::test_support::{merchant_records, GateHandle, GatedOperation, TestEngine};

/// リクエストを 1 件送り、ステータスと JSON ボディを返す。
async fn send(engine: &TestEngine, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let app = handler::router(engine.state.clone());
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

fn create_body(entity_type: &str, batch_size: u32) -> Value {
    json!({
        "job_kind": "IMPORT",
        "entity_type": entity_type,
        "tenant_id": "tenant-1",
        "credential_ref": "acme",
        "batch_size": batch_size,
    })
}

fn job_id_of(body: &Value) -> Uuid {
    Uuid::parse_str(body["job_id"].as_str().unwrap()).unwrap()
}

/// マーチャントの import だけをゲート付きオペレーションにしたエンジン。
fn gated_engine(total: u64) -> (TestEngine, GateHandle) {
    let (operation, gate) = GatedOperation::new(total);
    let mut registry = OperationRegistry::new();
    registry.register(JobKind::Import, EntityType::Merchant, Arc::new(operation));
    (TestEngine::build(Some(registry), Vec::new()), gate)
}

// ---------------------------------------------------------------------------
// Health / Readiness / Metrics / OpenAPI
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_healthz_and_readyz_return_ok() {
    let engine = TestEngine::new();
    for uri in ["/healthz", "/readyz"] {
        let (status, body) = send(&engine, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".to_string()));
    }
}

#[tokio::test]
async fn test_metrics_records_matched_route() {
    let engine = TestEngine::new();
    send(&engine, "GET", &format!("/api/v1/jobs/{}", Uuid::new_v4()), None).await;

    let (status, body) = send(&engine, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("/api/v1/jobs/{job_id}"));
}

#[tokio::test]
async fn test_openapi_document_lists_job_paths() {
    let engine = TestEngine::new();
    let (status, body) = send(&engine, "GET", "/api-docs/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"].get("/api/v1/jobs").is_some());
    assert!(body["paths"].get("/api/v1/jobs/{job_id}/resume").is_some());
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_import_job_runs_to_completion() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(45));

    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 20))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["entity_type"], "MERCHANT");
    let job_id = job_id_of(&body);

    engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();
    engine.wait_until_idle(job_id).await.unwrap();

    let (status, body) = send(&engine, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["progress"]["processed"], 45);
    assert_eq!(body["progress"]["total"], 45);
    assert_eq!(body["progress"]["percent"], 100.0);
    assert_eq!(body["results"]["created"], 45);
    assert_eq!(body["is_live"], false);
    assert!(body["completed_at"].is_string());

    assert_eq!(engine.job_repo.progress_writes(job_id), vec![0, 20, 40, 45]);
    assert_eq!(engine.mirror_repo.len().await, 45);
}

#[tokio::test]
async fn test_create_rejects_invalid_input() {
    let engine = TestEngine::new();

    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("BANK", 20))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SYS_BATCH_VALIDATION_ERROR");

    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("batch_size"));

    let mut selected = create_body("MERCHANT", 20);
    selected["only_selected"] = json!(true);
    let (status, _) = send(&engine, "POST", "/api/v1/jobs", Some(selected)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (list_status, list) = send(&engine, "GET", "/api/v1/jobs", None).await;
    assert_eq!(list_status, StatusCode::OK);
    assert_eq!(list["pagination"]["total_count"], 0);
}

#[tokio::test]
async fn test_create_unsupported_operation() {
    let (engine, _gate) = gated_engine(10);
    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("LENDER", 10))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SYS_BATCH_UNSUPPORTED_OPERATION");
}

#[tokio::test]
async fn test_create_conflict_identifies_existing_job() {
    let (engine, gate) = gated_engine(40);

    let (status, first) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let first_id = job_id_of(&first);

    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("merchant", 10))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SYS_BATCH_ACTIVE_JOB_EXISTS");
    assert_eq!(body["error"]["details"][0]["field"], "existing_job_id");
    assert_eq!(body["error"]["details"][0]["message"], first_id.to_string());

    // 別テナントは独立
    let mut other = create_body("MERCHANT", 10);
    other["tenant_id"] = json!("tenant-2");
    let (status, _) = send(&engine, "POST", "/api/v1/jobs", Some(other)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    gate.open();
    engine
        .wait_for_status(first_id, &[JobStatus::Completed])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_sync_requires_active_tenant_credential() {
    let engine = TestEngine::build(
        None,
        vec![TenantConfig {
            id: "tenant-1".to_string(),
            active: true,
            credential_refs: vec!["acme".to_string()],
        }],
    );

    let mut body = create_body("MERCHANT", 10);
    body["job_kind"] = json!("SYNC");
    body["credential_ref"] = json!("globex");
    let (status, response) = send(&engine, "POST", "/api/v1/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["error"]["code"], "SYS_BATCH_TENANT_REJECTED");

    body["credential_ref"] = json!("acme");
    let (status, response) = send(&engine, "POST", "/api/v1/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = job_id_of(&response);
    let job = engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();
    assert_eq!(job.progress.total, Some(0));
}

#[tokio::test]
async fn test_create_fails_when_data_source_unreachable() {
    let engine = TestEngine::new();
    engine.data_source.set_healthy(false);

    let (status, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "SYS_BATCH_DATA_SOURCE_UNAVAILABLE");

    let (_, list) = send(&engine, "GET", "/api/v1/jobs", None).await;
    assert_eq!(list["pagination"]["total_count"], 0);
}

// ---------------------------------------------------------------------------
// Get / List
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_get_job_not_found_and_invalid_id() {
    let engine = TestEngine::new();

    let (status, body) = send(&engine, "GET", &format!("/api/v1/jobs/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SYS_BATCH_JOB_NOT_FOUND");
    assert!(body["error"]["request_id"].is_string());
    assert!(body["error"].get("details").is_none());

    let (status, _) = send(&engine, "GET", "/api/v1/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_jobs_filters_and_counts() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(5));
    engine.data_source.seed(EntityType::Lender, Vec::new());

    let mut ids = Vec::new();
    for entity_type in ["MERCHANT", "LENDER"] {
        let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body(entity_type, 10))).await;
        ids.push(job_id_of(&body));
    }
    for id in &ids {
        engine
            .wait_for_status(*id, &[JobStatus::Completed])
            .await
            .unwrap();
    }
    engine.data_source.fail_fetch_at_offset(0);
    engine.data_source.seed(EntityType::Iso, merchant_records(3));
    let (_, failed) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("ISO", 10))).await;
    engine
        .wait_for_status(job_id_of(&failed), &[JobStatus::Failed])
        .await
        .unwrap();

    let (status, body) = send(
        &engine,
        "GET",
        "/api/v1/jobs?tenant_id=tenant-1&status=COMPLETED&page_size=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["pagination"]["total_count"], 2);
    assert_eq!(body["pagination"]["has_next"], true);
    assert_eq!(body["counts_by_status"]["COMPLETED"], 2);
    assert_eq!(body["counts_by_status"]["FAILED"], 1);
    assert_eq!(body["counts_by_status"]["RUNNING"], 0);

    let (_, body) = send(&engine, "GET", "/api/v1/jobs?entity_type=lender,iso", None).await;
    assert_eq!(body["pagination"]["total_count"], 2);

    let (status, body) = send(&engine, "GET", "/api/v1/jobs?status=DONE", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SYS_BATCH_VALIDATION_ERROR");
}

// ---------------------------------------------------------------------------
// Cancel / Pause / Resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_running_job_is_final() {
    let (engine, mut gate) = gated_engine(40);
    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    let job_id = job_id_of(&body);

    gate.release(2);
    assert_eq!(gate.next_checkpoint().await.unwrap(), 10);
    assert_eq!(gate.next_checkpoint().await.unwrap(), 20);

    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");

    gate.open();
    engine.wait_until_idle(job_id).await.unwrap();
    let job = engine
        .wait_for_status(job_id, &[JobStatus::Cancelled])
        .await
        .unwrap();
    assert_eq!(job.progress.processed, 20);
    assert_eq!(engine.job_repo.progress_writes(job_id), vec![0, 10, 20]);

    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SYS_BATCH_STATUS_MISMATCH");

    let (status, _) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/resume"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_pause_then_resume_continues_from_checkpoint() {
    let (engine, mut gate) = gated_engine(45);
    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    let job_id = job_id_of(&body);

    gate.release(1);
    assert_eq!(gate.next_checkpoint().await.unwrap(), 10);

    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PAUSED");

    // 旧ループが終了するまでは再開できない
    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/resume"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SYS_BATCH_LOOP_STILL_RUNNING");

    gate.open();
    engine.wait_until_idle(job_id).await.unwrap();
    let paused = engine
        .wait_for_status(job_id, &[JobStatus::Paused])
        .await
        .unwrap();
    assert_eq!(paused.progress.processed, 10);

    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/resume"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "RUNNING");
    assert_eq!(body["progress"]["processed"], 10);

    let done = engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();
    assert_eq!(done.progress.processed, 45);
    let writes = engine.job_repo.progress_writes(job_id);
    assert_eq!(writes, vec![0, 10, 20, 30, 40, 45]);
    assert!(writes.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_pause_requires_running_job() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(3));
    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    let job_id = job_id_of(&body);
    engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();

    let (status, body) = send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/pause"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["message"], "cannot pause a job in COMPLETED state");

    let (status, _) = send(&engine, "POST", &format!("/api/v1/jobs/{}/pause", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_resume_failed_job_with_parameter_patch() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(45));
    engine.data_source.fail_fetch_at_offset(20);

    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 20))).await;
    let job_id = job_id_of(&body);
    let failed = engine
        .wait_for_status(job_id, &[JobStatus::Failed])
        .await
        .unwrap();
    assert_eq!(failed.progress.processed, 20);
    assert!(failed.error.unwrap().contains("offset 20"));
    engine.wait_until_idle(job_id).await.unwrap();

    let (status, body) = send(
        &engine,
        "POST",
        &format!("/api/v1/jobs/{job_id}/resume"),
        Some(json!({"resume_from_index": 50})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SYS_BATCH_VALIDATION_ERROR");

    // 取得できないページの先頭レコードを飛ばし、バッチサイズを変えて再開する
    let (status, body) = send(
        &engine,
        "POST",
        &format!("/api/v1/jobs/{job_id}/resume"),
        Some(json!({"resume_from_index": 21, "parameters": {"batch_size": 25}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["parameters"]["batch_size"], 25);
    assert_eq!(body["progress"]["processed"], 21);
    assert!(body["error"].is_null());

    let done = engine
        .wait_for_status(job_id, &[JobStatus::Completed, JobStatus::Failed])
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.processed, 45);
    assert_eq!(done.results.unwrap().created, 24);
    assert_eq!(engine.mirror_repo.len().await, 44);
}

#[tokio::test]
async fn test_resume_all_resumes_paused_jobs() {
    let (engine, mut gate) = gated_engine(30);
    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 10))).await;
    let job_id = job_id_of(&body);
    gate.release(1);
    gate.next_checkpoint().await.unwrap();
    send(&engine, "POST", &format!("/api/v1/jobs/{job_id}/pause"), None).await;
    gate.open();
    engine.wait_until_idle(job_id).await.unwrap();

    let (status, body) = send(
        &engine,
        "POST",
        "/api/v1/jobs/resume-all",
        Some(json!({"tenant_id": "tenant-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed"], 1);
    assert_eq!(body["failed"], 0);
    assert_eq!(body["outcomes"][0]["job_id"], job_id.to_string());
    assert_eq!(body["outcomes"][0]["resumed"], true);

    let done = engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();
    assert_eq!(done.progress.processed, 30);

    let (status, _) = send(
        &engine,
        "POST",
        "/api/v1/jobs/resume-all",
        Some(json!({"tenant_id": " "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Progress summary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_progress_summary_for_tenant() {
    let engine = TestEngine::new();
    engine.data_source.seed(EntityType::Merchant, merchant_records(12));

    let (_, body) = send(&engine, "POST", "/api/v1/jobs", Some(create_body("MERCHANT", 5))).await;
    let job_id = job_id_of(&body);
    engine
        .wait_for_status(job_id, &[JobStatus::Completed])
        .await
        .unwrap();

    let (status, body) = send(&engine, "GET", "/api/v1/tenants/tenant-1/progress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], "tenant-1");
    assert_eq!(body["entities"].as_array().unwrap().len(), 8);
    assert_eq!(body["selection_percent"], 12.5);
    assert_eq!(body["completion_percent"], 12.5);
    let merchant = body["entities"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["entity_type"] == "MERCHANT")
        .unwrap();
    assert_eq!(merchant["latest_job_id"], job_id.to_string());
    assert_eq!(merchant["completion_percent"], 100.0);
    assert_eq!(body["timeline"].as_array().unwrap().len(), 1);

    let (_, body) = send(&engine, "GET", "/api/v1/tenants/tenant-1/progress?job_kind=SYNC", None).await;
    assert_eq!(body["selection_percent"], 0.0);

    let (status, _) = send(&engine, "GET", "/api/v1/tenants/tenant-1/progress?job_kind=EXPORT", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
