use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::entity::batch_job::{EntityType, JobKind, JobParameters, JobResults};

/// results.details に保持するエンティティ単位エラーの上限。
pub const MAX_ERROR_DETAILS: usize = 100;

/// OperationContext はオペレーション実行 1 回分の入力。
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub job_id: Uuid,
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub tenant_id: String,
    pub parameters: JobParameters,
    /// 安定順序で先頭から読み飛ばす件数。
    pub resume_from_index: u64,
    pub total: u64,
}

impl OperationContext {
    /// この実行で処理してよい残り件数。
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.resume_from_index)
    }
}

/// InterruptKind は協調的な中断の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    Cancelled,
    Paused,
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// OperationError はオペレーションから実行ループへ伝播するエラー。
/// Interrupted は失敗ではなく、キャンセル・一時停止の制御フローである。
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("job {0}")]
    Interrupted(InterruptKind),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// EntityFailure はエンティティ単位で回復されたエラー。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub external_id: String,
    pub message: String,
}

/// OperationSummary はオペレーションが数えたエンティティ単位の結果。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSummary {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<EntityFailure>,
}

impl OperationSummary {
    /// 失敗件数を加算し、詳細は上限まで保持する。
    pub fn record_failure(&mut self, external_id: &str, message: impl Into<String>) {
        self.failed += 1;
        if self.errors.len() < MAX_ERROR_DETAILS {
            self.errors.push(EntityFailure {
                external_id: external_id.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn units(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }

    pub fn into_results(self) -> JobResults {
        let truncated = self.failed > self.errors.len() as u64;
        JobResults {
            created: self.created,
            updated: self.updated,
            skipped: self.skipped,
            failed: self.failed,
            details: serde_json::json!({
                "errors": self.errors,
                "errors_truncated": truncated,
            }),
        }
    }
}

/// ProgressReporter はバッチごとにオペレーションから呼ばれるチェックポイント。
/// 中断が要求されていれば Interrupted を返すので、呼び出し側は `?` で伝播させる。
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// processed はこの実行内での処理件数（resume_from_index からの相対値）。
    async fn report(
        &self,
        processed: u64,
        current_entity: Option<String>,
    ) -> Result<(), OperationError>;
}

/// EntityOperation は (JobKind, EntityType) ごとの処理ストラテジー。
///
/// 実装は外部 ID の昇順という安定した順序でエンティティを列挙し、
/// 先頭 resume_from_index 件を読み飛ばし、remaining() 件を超えて処理してはならない。
#[async_trait]
pub trait EntityOperation: Send + Sync {
    /// 処理対象の総件数を返す。
    async fn count(&self, tenant_id: &str, parameters: &JobParameters) -> anyhow::Result<u64>;

    async fn run(
        &self,
        ctx: &OperationContext,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary, OperationError>;
}
