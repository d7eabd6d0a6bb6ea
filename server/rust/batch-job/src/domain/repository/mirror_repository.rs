use async_trait::async_trait;

use crate::domain::entity::batch_job::EntityType;
use crate::domain::entity::mirror_record::MirrorRecord;

/// MirrorRepository はテナント別ローカルミラーのリポジトリトレイト。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MirrorRepository: Send + Sync {
    async fn find(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<Option<MirrorRecord>>;

    async fn upsert(&self, record: &MirrorRecord) -> anyhow::Result<()>;

    /// 外部へ未反映のレコード数。filter_ids が空でなければその ID に限定する。
    async fn count_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        filter_ids: &[String],
    ) -> anyhow::Result<u64>;

    /// external_id 昇順で after より後の未反映レコードを最大 limit 件返す。
    async fn find_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        after: Option<String>,
        filter_ids: &[String],
        limit: u32,
    ) -> anyhow::Result<Vec<MirrorRecord>>;

    async fn mark_synced(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<()>;
}
