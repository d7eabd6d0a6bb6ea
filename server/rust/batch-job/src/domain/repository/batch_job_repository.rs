use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, EntityType, JobKind, JobProgress, JobStatus};

/// JobListParams はジョブ一覧取得のパラメータ。空の Vec はフィルタなしを意味する。
#[derive(Debug, Clone, Default)]
pub struct JobListParams {
    pub tenant_id: Option<String>,
    pub statuses: Vec<JobStatus>,
    pub entity_types: Vec<EntityType>,
    pub job_kind: Option<JobKind>,
    pub page: i32,
    pub page_size: i32,
}

impl JobListParams {
    pub fn matches(&self, job: &BatchJob) -> bool {
        if let Some(ref tenant_id) = self.tenant_id {
            if job.tenant_id != *tenant_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if !self.entity_types.is_empty() && !self.entity_types.contains(&job.entity_type) {
            return false;
        }
        if let Some(kind) = self.job_kind {
            if job.job_kind != kind {
                return false;
            }
        }
        true
    }
}

/// BatchJobRepository はバッチジョブ永続化のためのリポジトリトレイト。
/// ジョブの正となる状態はこのストアにあり、プロセス内の実行ループはそのキャッシュにすぎない。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchJobRepository: Send + Sync {
    async fn create(&self, job: &BatchJob) -> anyhow::Result<()>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<BatchJob>>;

    /// (entity_type, tenant_id) に対する PENDING / RUNNING / PAUSED のジョブを返す。
    async fn find_active(
        &self,
        entity_type: EntityType,
        tenant_id: &str,
    ) -> anyhow::Result<Option<BatchJob>>;

    /// テナントのエンティティ種別ごとに最も新しく作成されたジョブを返す（最大で種別数）。
    async fn find_latest_per_entity_type(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<Vec<BatchJob>>;

    /// 作成日時の降順で一覧を返す。戻り値の i64 はフィルタ後の総件数。
    async fn list(&self, params: &JobListParams) -> anyhow::Result<(Vec<BatchJob>, i64)>;

    /// ステータス別件数。params のステータスフィルタとページングは無視する。
    async fn count_by_status(
        &self,
        params: &JobListParams,
    ) -> anyhow::Result<HashMap<JobStatus, i64>>;

    /// RUNNING のジョブに限り進捗とハートビートを更新する。
    /// ジョブが RUNNING でなくなっていた場合は false を返す。
    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> anyhow::Result<bool>;

    /// 現在のステータスが expected のいずれかである場合のみジョブ全体を書き込む。
    /// 書き込み前のステータスが RUNNING の場合、進捗とハートビートは保存済みの値を保持する
    /// （RUNNING 中の進捗は update_progress だけが書き込む）。
    async fn update_if_status(
        &self,
        job: &BatchJob,
        expected: &[JobStatus],
    ) -> anyhow::Result<bool>;

    /// ハートビートが heartbeat_before より古い RUNNING ジョブを返す。
    async fn find_stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<BatchJob>>;
}
