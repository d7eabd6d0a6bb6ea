pub mod http_data_source;

use async_trait::async_trait;

use crate::domain::entity::batch_job::EntityType;
use crate::domain::entity::mirror_record::ExternalRecord;

pub use http_data_source::HttpDataSource;

/// ExternalDataSource は取引先の外部システム API を抽象化するトレイト。
/// 一覧系の呼び出しは external_id の昇順で結果を返すこと。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalDataSource: Send + Sync {
    /// 接続確認。到達できるが不健全な場合は Ok(false) を返す。
    async fn test_connection(&self, credential_ref: &str) -> anyhow::Result<bool>;

    async fn count(&self, credential_ref: &str, entity_type: EntityType) -> anyhow::Result<u64>;

    async fn fetch_page(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        offset: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<ExternalRecord>>;

    /// 指定 ID のレコードを返す。存在しない ID は結果に含まれない。
    async fn fetch_by_ids(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        ids: &[String],
    ) -> anyhow::Result<Vec<ExternalRecord>>;

    async fn push_record(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        record: &ExternalRecord,
    ) -> anyhow::Result<()>;
}
