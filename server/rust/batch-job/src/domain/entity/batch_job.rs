use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JobKind はバッチジョブの種別を表す。
/// IMPORT は外部システムからローカルミラーへの取り込み、SYNC はローカルの変更を外部へ反映する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Import,
    Sync,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Import => write!(f, "IMPORT"),
            Self::Sync => write!(f, "SYNC"),
        }
    }
}

impl JobKind {
    pub fn from_str_value(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "IMPORT" => Ok(Self::Import),
            "SYNC" => Ok(Self::Sync),
            _ => anyhow::bail!("invalid job kind: {}", s),
        }
    }
}

/// EntityType はバッチジョブの対象となる業務エンティティの種類。
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    User,
    Lender,
    Iso,
    Merchant,
    Syndicator,
    Advance,
    Underwriter,
    Representative,
}

impl EntityType {
    /// 全エンティティ種別。進捗サマリーの表示順でもある。
    pub const ALL: [EntityType; 8] = [
        Self::User,
        Self::Lender,
        Self::Iso,
        Self::Merchant,
        Self::Syndicator,
        Self::Advance,
        Self::Underwriter,
        Self::Representative,
    ];

    pub fn from_str_value(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "LENDER" => Ok(Self::Lender),
            "ISO" => Ok(Self::Iso),
            "MERCHANT" => Ok(Self::Merchant),
            "SYNDICATOR" => Ok(Self::Syndicator),
            "ADVANCE" => Ok(Self::Advance),
            "UNDERWRITER" => Ok(Self::Underwriter),
            "REPRESENTATIVE" => Ok(Self::Representative),
            _ => anyhow::bail!("invalid entity type: {}", s),
        }
    }

    /// 外部データソース API 上のコレクション名を返す。
    pub fn collection(&self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Lender => "lenders",
            Self::Iso => "isos",
            Self::Merchant => "merchants",
            Self::Syndicator => "syndicators",
            Self::Advance => "advances",
            Self::Underwriter => "underwriters",
            Self::Representative => "representatives",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "USER"),
            Self::Lender => write!(f, "LENDER"),
            Self::Iso => write!(f, "ISO"),
            Self::Merchant => write!(f, "MERCHANT"),
            Self::Syndicator => write!(f, "SYNDICATOR"),
            Self::Advance => write!(f, "ADVANCE"),
            Self::Underwriter => write!(f, "UNDERWRITER"),
            Self::Representative => write!(f, "REPRESENTATIVE"),
        }
    }
}

/// JobStatus はバッチジョブのライフサイクル状態を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 同一 (entity_type, tenant_id) で同時に一つしか存在できない状態。
    pub const ACTIVE: [JobStatus; 3] = [Self::Pending, Self::Running, Self::Paused];

    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// resume の受付対象か。FAILED は終端だが再開可能。
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }

    pub fn from_str_value(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => anyhow::bail!("invalid job status: {}", s),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// JobParameters はジョブ作成時に指定されるオペレーション設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobParameters {
    /// 外部データソースの接続情報を指す参照名。秘密値そのものは保持しない。
    pub credential_ref: String,
    pub batch_size: u32,
    #[serde(default)]
    pub update_existing: bool,
    #[serde(default)]
    pub only_selected: bool,
    #[serde(default)]
    pub selected_ids: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl JobParameters {
    /// 選択 ID を昇順・重複なしで返す。オペレーションはこの順序で処理する。
    pub fn normalized_selection(&self) -> Vec<String> {
        let mut ids = self.selected_ids.clone();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// JobParametersPatch は resume 時に上書きできるパラメータ。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobParametersPatch {
    pub batch_size: Option<u32>,
    pub update_existing: Option<bool>,
    pub dry_run: Option<bool>,
}

impl JobParametersPatch {
    pub fn is_empty(&self) -> bool {
        self.batch_size.is_none() && self.update_existing.is_none() && self.dry_run.is_none()
    }

    /// 指定されたフィールドのみ上書きする。
    pub fn apply(&self, params: &mut JobParameters) {
        if let Some(batch_size) = self.batch_size {
            params.batch_size = batch_size;
        }
        if let Some(update_existing) = self.update_existing {
            params.update_existing = update_existing;
        }
        if let Some(dry_run) = self.dry_run {
            params.dry_run = dry_run;
        }
    }
}

/// JobProgress は永続化されたチェックポイントを表す。
/// processed は resume 時の再開位置になる。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobProgress {
    pub processed: u64,
    /// 最初のカウントが完了するまでは None。
    pub total: Option<u64>,
    pub current_entity: Option<String>,
    pub last_progress_update: Option<DateTime<Utc>>,
}

impl JobProgress {
    /// 完了率（0.0〜100.0）。total が未確定の場合は 0。
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(0) => 100.0,
            Some(total) => (self.processed.min(total) as f64 / total as f64) * 100.0,
            None => 0.0,
        }
    }
}

/// JobResults はジョブ終了時の集計結果。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobResults {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    /// エンティティ単位のエラー等、任意の詳細情報。
    #[serde(default)]
    pub details: serde_json::Value,
}

impl JobResults {
    pub fn units(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// TransitionError は許可されていない状態遷移を表す。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a job in {from} state")]
pub struct TransitionError {
    pub from: JobStatus,
    pub action: &'static str,
}

/// BatchJob は永続化されるバッチジョブのレコード。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BatchJob {
    pub id: Uuid,
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub tenant_id: String,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub progress: JobProgress,
    pub results: Option<JobResults>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// 実行ループが最後にチェックポイントを書いた時刻。リース判定に使う。
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// PENDING 状態の新しいジョブを作成する。
    pub fn new(
        job_kind: JobKind,
        entity_type: EntityType,
        tenant_id: String,
        parameters: JobParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_kind,
            entity_type,
            tenant_id,
            status: JobStatus::Pending,
            parameters,
            progress: JobProgress::default(),
            results: None,
            error: None,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            updated_at: now,
            heartbeat_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure(&self, allowed: &[JobStatus], action: &'static str) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                action,
            })
        }
    }

    /// PENDING から RUNNING へ遷移する。started_at は初回のみ設定される。
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.ensure(&[JobStatus::Pending], "start")?;
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.started_at.get_or_insert(now);
        self.heartbeat_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.ensure(&[JobStatus::Running], "pause")?;
        let now = Utc::now();
        self.status = JobStatus::Paused;
        self.paused_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.ensure(&JobStatus::ACTIVE, "cancel")?;
        let now = Utc::now();
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, results: JobResults) -> Result<(), TransitionError> {
        self.ensure(&[JobStatus::Running], "complete")?;
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.results = Some(results);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING から FAILED へ遷移する。PENDING のままループが起動できなかった場合も許可する。
    pub fn fail(&mut self, error: String) -> Result<(), TransitionError> {
        self.ensure(&[JobStatus::Pending, JobStatus::Running], "fail")?;
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PAUSED / FAILED から RUNNING へ戻す。
    /// 再開位置は processed に設定され、total は再計算しない。
    pub fn resume(
        &mut self,
        resume_from_index: u64,
        patch: Option<&JobParametersPatch>,
    ) -> Result<(), TransitionError> {
        self.ensure(&[JobStatus::Paused, JobStatus::Failed], "resume")?;
        if let Some(patch) = patch {
            patch.apply(&mut self.parameters);
        }
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.error = None;
        self.started_at.get_or_insert(now);
        self.progress.processed = resume_from_index;
        self.progress.last_progress_update = Some(now);
        self.heartbeat_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}
