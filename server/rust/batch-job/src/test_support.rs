//! テスト用フェイクとヘルパー。
//! ユニットテストと統合テスト（tests/*.rs）の双方から利用する。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::adapter::data_source::ExternalDataSource;
use crate::adapter::handler::AppState;
use crate::adapter::repository::batch_job_in_memory::InMemoryBatchJobRepository;
use crate::adapter::repository::mirror_in_memory::InMemoryMirrorRepository;
use crate::adapter::repository::tenant_directory_static::StaticTenantDirectory;
use crate::domain::entity::batch_job::{
    BatchJob, EntityType, JobKind, JobParameters, JobProgress, JobStatus,
};
use crate::domain::entity::mirror_record::ExternalRecord;
use crate::domain::repository::{BatchJobRepository, JobListParams, TenantDirectory};
use crate::domain::service::{
    EntityOperation, InterruptKind, OperationContext, OperationError, OperationRegistry,
    OperationSummary, ProgressReporter,
};
use crate::infrastructure::config::TenantConfig;
use crate::infrastructure::operations;
use crate::infrastructure::run_registry::{InMemoryRunRegistry, RunControl, RunRegistry};
use crate::usecase::{
    BatchLimits, CancelJobUseCase, CreateJobUseCase, ExecuteJobUseCase, GetJobUseCase,
    ListJobsUseCase, PauseJobUseCase, ProgressSummaryUseCase, ResumeAllJobsUseCase,
    ResumeJobUseCase,
};

// ---------------------------------------------------------------------------
// sample data
// ---------------------------------------------------------------------------

/// m-000, m-001, ... の ID を持つマーチャントレコードを生成する。
pub fn merchant_records(count: usize) -> Vec<ExternalRecord> {
    (0..count)
        .map(|i| {
            let id = format!("m-{i:03}");
            let payload = serde_json::json!({"id": id, "name": format!("Merchant {i}")});
            ExternalRecord::new(id, payload)
        })
        .collect()
}

pub fn make_parameters(credential_ref: &str, batch_size: u32) -> JobParameters {
    JobParameters {
        credential_ref: credential_ref.to_string(),
        batch_size,
        update_existing: false,
        only_selected: false,
        selected_ids: vec![],
        dry_run: false,
    }
}

// ---------------------------------------------------------------------------
// FakeDataSource
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeDataSourceState {
    records: BTreeMap<EntityType, Vec<ExternalRecord>>,
    unhealthy: bool,
    failing_offsets: HashSet<u64>,
    rejected_ids: HashSet<String>,
    pushed: Vec<String>,
}

/// テスト用インメモリ ExternalDataSource 実装。
/// レコードは external_id 昇順で保持する。
#[derive(Default)]
pub struct FakeDataSource {
    state: Mutex<FakeDataSourceState>,
}

impl FakeDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeDataSourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed(&self, entity_type: EntityType, mut records: Vec<ExternalRecord>) {
        records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        self.lock().records.insert(entity_type, records);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().unhealthy = !healthy;
    }

    /// 指定 offset のページ取得を失敗させる。
    pub fn fail_fetch_at_offset(&self, offset: u64) {
        self.lock().failing_offsets.insert(offset);
    }

    pub fn reject_push(&self, external_id: &str) {
        self.lock().rejected_ids.insert(external_id.to_string());
    }

    pub fn pushed_ids(&self) -> Vec<String> {
        self.lock().pushed.clone()
    }
}

#[async_trait]
impl ExternalDataSource for FakeDataSource {
    async fn test_connection(&self, _credential_ref: &str) -> anyhow::Result<bool> {
        Ok(!self.lock().unhealthy)
    }

    async fn count(&self, _credential_ref: &str, entity_type: EntityType) -> anyhow::Result<u64> {
        Ok(self
            .lock()
            .records
            .get(&entity_type)
            .map_or(0, |records| records.len() as u64))
    }

    async fn fetch_page(
        &self,
        _credential_ref: &str,
        entity_type: EntityType,
        offset: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<ExternalRecord>> {
        let state = self.lock();
        if state.failing_offsets.contains(&offset) {
            anyhow::bail!("external API returned 503 at offset {offset}");
        }
        let start = usize::try_from(offset)?;
        let limit = usize::try_from(limit)?;
        Ok(state
            .records
            .get(&entity_type)
            .map(|records| records.iter().skip(start).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_by_ids(
        &self,
        _credential_ref: &str,
        entity_type: EntityType,
        ids: &[String],
    ) -> anyhow::Result<Vec<ExternalRecord>> {
        Ok(self
            .lock()
            .records
            .get(&entity_type)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| ids.contains(&r.external_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn push_record(
        &self,
        _credential_ref: &str,
        _entity_type: EntityType,
        record: &ExternalRecord,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        if state.rejected_ids.contains(&record.external_id) {
            anyhow::bail!("external system rejected {}", record.external_id);
        }
        state.pushed.push(record.external_id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// 報告された processed を記録する ProgressReporter。
/// interrupt_after(n, kind) の場合、n 回までは成功し、以降は Interrupted を返す。
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<u64>>,
    interrupt: Option<(usize, InterruptKind)>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt_after(reports: usize, kind: InterruptKind) -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            interrupt: Some((reports, kind)),
        }
    }

    pub fn reports(&self) -> Vec<u64> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProgressReporter for RecordingReporter {
    async fn report(
        &self,
        processed: u64,
        _current_entity: Option<String>,
    ) -> Result<(), OperationError> {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((limit, kind)) = self.interrupt {
            if reports.len() >= limit {
                return Err(OperationError::Interrupted(kind));
            }
        }
        reports.push(processed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedOperation / GatedOperation
// ---------------------------------------------------------------------------

/// 固定の total を数え、batch_size 刻みで報告するだけのオペレーション。
/// fail_at_batch を指定すると、その番号（1 始まり）のバッチで致命的エラーを返す。
pub struct ScriptedOperation {
    total: u64,
    fail_at_batch: Option<usize>,
}

impl ScriptedOperation {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            fail_at_batch: None,
        }
    }

    pub fn failing_at_batch(total: u64, batch: usize) -> Self {
        Self {
            total,
            fail_at_batch: Some(batch),
        }
    }
}

#[async_trait]
impl EntityOperation for ScriptedOperation {
    async fn count(&self, _tenant_id: &str, _parameters: &JobParameters) -> anyhow::Result<u64> {
        Ok(self.total)
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary, OperationError> {
        let mut summary = OperationSummary::default();
        let batch_size = u64::from(ctx.parameters.batch_size.max(1));
        let remaining = ctx.remaining();
        let mut done = 0u64;
        let mut batch = 0usize;
        while done < remaining {
            batch += 1;
            if self.fail_at_batch == Some(batch) {
                return Err(anyhow::anyhow!("external API unavailable in batch {batch}").into());
            }
            let step = batch_size.min(remaining - done);
            summary.created += step;
            done += step;
            reporter
                .report(done, Some(format!("e-{}", ctx.resume_from_index + done)))
                .await?;
        }
        Ok(summary)
    }
}

/// GatedOperation はバッチ処理の直前でテストからの許可を待つオペレーション。
/// 実行ループを任意のチェックポイントで止めた状態を作るために使う。
pub struct GatedOperation {
    total: u64,
    permits: Arc<Semaphore>,
    checkpoints: mpsc::UnboundedSender<u64>,
}

/// GateHandle は GatedOperation をテスト側から操作するハンドル。
pub struct GateHandle {
    permits: Arc<Semaphore>,
    checkpoints: mpsc::UnboundedReceiver<u64>,
}

impl GatedOperation {
    pub fn new(total: u64) -> (Self, GateHandle) {
        let permits = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                total,
                permits: Arc::clone(&permits),
                checkpoints: tx,
            },
            GateHandle {
                permits,
                checkpoints: rx,
            },
        )
    }
}

impl GateHandle {
    /// batches 回分のバッチ処理を許可する。
    pub fn release(&self, batches: usize) {
        self.permits.add_permits(batches);
    }

    /// 以降のバッチをすべて許可する。
    pub fn open(&self) {
        self.permits.add_permits(1 << 20);
    }

    /// 次に報告が成功したチェックポイント（相対 processed）を待つ。
    pub async fn next_checkpoint(&mut self) -> anyhow::Result<u64> {
        tokio::time::timeout(Duration::from_secs(5), self.checkpoints.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("gated operation dropped"))
    }
}

#[async_trait]
impl EntityOperation for GatedOperation {
    async fn count(&self, _tenant_id: &str, _parameters: &JobParameters) -> anyhow::Result<u64> {
        Ok(self.total)
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary, OperationError> {
        let mut summary = OperationSummary::default();
        let batch_size = u64::from(ctx.parameters.batch_size.max(1));
        let remaining = ctx.remaining();
        let mut done = 0u64;
        while done < remaining {
            self.permits
                .acquire()
                .await
                .map_err(anyhow::Error::from)?
                .forget();
            let step = batch_size.min(remaining - done);
            summary.created += step;
            done += step;
            reporter.report(done, None).await?;
            let _ = self.checkpoints.send(done);
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// RecordingBatchJobRepository
// ---------------------------------------------------------------------------

/// 成功した進捗書き込みを記録する BatchJobRepository ラッパー。
#[derive(Default)]
pub struct RecordingBatchJobRepository {
    inner: InMemoryBatchJobRepository,
    progress_writes: Mutex<Vec<(Uuid, u64)>>,
}

impl RecordingBatchJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_writes(&self, job_id: Uuid) -> Vec<u64> {
        self.progress_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, processed)| *processed)
            .collect()
    }
}

#[async_trait]
impl BatchJobRepository for RecordingBatchJobRepository {
    async fn create(&self, job: &BatchJob) -> anyhow::Result<()> {
        self.inner.create(job).await
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<BatchJob>> {
        self.inner.find_by_id(id).await
    }

    async fn find_active(
        &self,
        entity_type: EntityType,
        tenant_id: &str,
    ) -> anyhow::Result<Option<BatchJob>> {
        self.inner.find_active(entity_type, tenant_id).await
    }

    async fn find_latest_per_entity_type(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        self.inner
            .find_latest_per_entity_type(tenant_id, job_kind)
            .await
    }

    async fn list(&self, params: &JobListParams) -> anyhow::Result<(Vec<BatchJob>, i64)> {
        self.inner.list(params).await
    }

    async fn count_by_status(
        &self,
        params: &JobListParams,
    ) -> anyhow::Result<std::collections::HashMap<JobStatus, i64>> {
        self.inner.count_by_status(params).await
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> anyhow::Result<bool> {
        let written = self.inner.update_progress(id, progress).await?;
        if written {
            self.progress_writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((id, progress.processed));
        }
        Ok(written)
    }

    async fn update_if_status(
        &self,
        job: &BatchJob,
        expected: &[JobStatus],
    ) -> anyhow::Result<bool> {
        self.inner.update_if_status(job, expected).await
    }

    async fn find_stale_running(
        &self,
        heartbeat_before: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        self.inner.find_stale_running(heartbeat_before).await
    }
}

// ---------------------------------------------------------------------------
// LatchFirstRepository
// ---------------------------------------------------------------------------

/// 実行ループがラッチを観測した時点で先に最終状態を書く状況を再現する
/// BatchJobRepository ラッパー。
///
/// ラッチが立った状態で CANCELLED / PAUSED の書き込みが来ると、ループ側の書き込みとして
/// 同じ内容を反映したうえで、呼び出し元の compare-and-set は外れたものとして false を返す。
pub struct LatchFirstRepository {
    inner: InMemoryBatchJobRepository,
    control: Arc<RunControl>,
}

impl LatchFirstRepository {
    pub fn new(control: Arc<RunControl>) -> Self {
        Self {
            inner: InMemoryBatchJobRepository::new(),
            control,
        }
    }
}

#[async_trait]
impl BatchJobRepository for LatchFirstRepository {
    async fn create(&self, job: &BatchJob) -> anyhow::Result<()> {
        self.inner.create(job).await
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<BatchJob>> {
        self.inner.find_by_id(id).await
    }

    async fn find_active(
        &self,
        entity_type: EntityType,
        tenant_id: &str,
    ) -> anyhow::Result<Option<BatchJob>> {
        self.inner.find_active(entity_type, tenant_id).await
    }

    async fn find_latest_per_entity_type(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        self.inner
            .find_latest_per_entity_type(tenant_id, job_kind)
            .await
    }

    async fn list(&self, params: &JobListParams) -> anyhow::Result<(Vec<BatchJob>, i64)> {
        self.inner.list(params).await
    }

    async fn count_by_status(
        &self,
        params: &JobListParams,
    ) -> anyhow::Result<std::collections::HashMap<JobStatus, i64>> {
        self.inner.count_by_status(params).await
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> anyhow::Result<bool> {
        self.inner.update_progress(id, progress).await
    }

    async fn update_if_status(
        &self,
        job: &BatchJob,
        expected: &[JobStatus],
    ) -> anyhow::Result<bool> {
        let loop_sees_latch = self.control.interrupt().is_some()
            && matches!(job.status, JobStatus::Cancelled | JobStatus::Paused);
        if loop_sees_latch {
            self.inner.update_if_status(job, expected).await?;
            return Ok(false);
        }
        self.inner.update_if_status(job, expected).await
    }

    async fn find_stale_running(
        &self,
        heartbeat_before: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        self.inner.find_stale_running(heartbeat_before).await
    }
}

// ---------------------------------------------------------------------------
// TestEngine
// ---------------------------------------------------------------------------

/// TestEngine はインメモリの協調オブジェクトで組み立てたエンジン一式。
pub struct TestEngine {
    pub job_repo: Arc<RecordingBatchJobRepository>,
    pub mirror_repo: Arc<InMemoryMirrorRepository>,
    pub data_source: Arc<FakeDataSource>,
    pub run_registry: Arc<InMemoryRunRegistry>,
    pub executor: Arc<ExecuteJobUseCase>,
    pub state: AppState,
}

impl TestEngine {
    /// Import / Sync の実オペレーションを登録したエンジン。
    pub fn new() -> Self {
        Self::build(None, Vec::new())
    }

    /// operations が Some の場合は既定の Import / Sync の代わりにそれを使う。
    pub fn build(operations: Option<OperationRegistry>, tenants: Vec<TenantConfig>) -> Self {
        let job_repo = Arc::new(RecordingBatchJobRepository::new());
        let mirror_repo = Arc::new(InMemoryMirrorRepository::new());
        let data_source = Arc::new(FakeDataSource::new());
        let run_registry = Arc::new(InMemoryRunRegistry::new(16));
        let operations = Arc::new(operations.unwrap_or_else(|| {
            operations::default_registry(data_source.clone(), mirror_repo.clone())
        }));
        let tenant_directory: Arc<dyn TenantDirectory> =
            Arc::new(StaticTenantDirectory::new(tenants));

        let metrics = Arc::new(
            mca_telemetry::metrics::Metrics::new("test")
                .unwrap_or_else(|e| panic!("failed to build test metrics: {e}")),
        );
        let (executor, state) = make_test_app_state(
            job_repo.clone(),
            run_registry.clone(),
            operations,
            data_source.clone(),
            tenant_directory,
            metrics,
        );

        Self {
            job_repo,
            mirror_repo,
            data_source,
            run_registry,
            executor,
            state,
        }
    }

    /// 指定ステータスになるまでジョブをポーリングする。
    pub async fn wait_for_status(
        &self,
        job_id: Uuid,
        statuses: &[JobStatus],
    ) -> anyhow::Result<BatchJob> {
        wait_for_status(self.job_repo.as_ref(), job_id, statuses).await
    }

    /// 実行ループが登録から消えるまで待つ。
    pub async fn wait_until_idle(&self, job_id: Uuid) -> anyhow::Result<()> {
        let registry = self.run_registry.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while registry.is_live(job_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("execution loop for {job_id} did not exit"))
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// テスト用 AppState を構築するヘルパー。
pub fn make_test_app_state(
    job_repo: Arc<dyn BatchJobRepository>,
    run_registry: Arc<dyn RunRegistry>,
    operations: Arc<OperationRegistry>,
    data_source: Arc<dyn ExternalDataSource>,
    tenant_directory: Arc<dyn TenantDirectory>,
    metrics: Arc<mca_telemetry::metrics::Metrics>,
) -> (Arc<ExecuteJobUseCase>, AppState) {
    let limits = BatchLimits::default();
    let admission = Arc::new(tokio::sync::Mutex::new(()));

    let executor = Arc::new(ExecuteJobUseCase::new(
        job_repo.clone(),
        run_registry.clone(),
        operations.clone(),
        Some(metrics.clone()),
    ));
    let resume_job_uc = Arc::new(ResumeJobUseCase::new(
        job_repo.clone(),
        run_registry.clone(),
        executor.clone(),
        admission.clone(),
        limits,
    ));

    let state = AppState {
        create_job_uc: Arc::new(CreateJobUseCase::new(
            job_repo.clone(),
            operations,
            data_source,
            tenant_directory,
            executor.clone(),
            admission,
            limits,
        )),
        get_job_uc: Arc::new(GetJobUseCase::new(job_repo.clone(), run_registry.clone())),
        list_jobs_uc: Arc::new(ListJobsUseCase::new(job_repo.clone())),
        cancel_job_uc: Arc::new(CancelJobUseCase::new(job_repo.clone(), run_registry.clone())),
        pause_job_uc: Arc::new(PauseJobUseCase::new(job_repo.clone(), run_registry)),
        resume_all_jobs_uc: Arc::new(ResumeAllJobsUseCase::new(
            job_repo.clone(),
            resume_job_uc.clone(),
        )),
        resume_job_uc,
        progress_summary_uc: Arc::new(ProgressSummaryUseCase::new(job_repo)),
        metrics,
    };
    (executor, state)
}

/// 指定ステータスになるまでジョブをポーリングする。
pub async fn wait_for_status(
    repo: &dyn BatchJobRepository,
    job_id: Uuid,
    statuses: &[JobStatus],
) -> anyhow::Result<BatchJob> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = repo.find_by_id(job_id).await? {
            if statuses.contains(&job.status) {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("job {job_id} stuck in {} (wanted {statuses:?})", job.status);
            }
        } else if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("job {job_id} not found");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
