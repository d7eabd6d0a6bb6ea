use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::entity::batch_job::EntityType;
use crate::domain::entity::mirror_record::MirrorRecord;
use crate::domain::repository::MirrorRepository;

type MirrorKey = (String, EntityType, String);

/// InMemoryMirrorRepository はインメモリのミラーリポジトリ。
/// キー順（テナント、種別、external_id）に保持するため走査順は常に昇順になる。
pub struct InMemoryMirrorRepository {
    records: RwLock<BTreeMap<MirrorKey, MirrorRecord>>,
}

impl InMemoryMirrorRepository {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryMirrorRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn key(tenant_id: &str, entity_type: EntityType, external_id: &str) -> MirrorKey {
    (tenant_id.to_string(), entity_type, external_id.to_string())
}

fn is_pending(record: &MirrorRecord, filter_ids: &[String]) -> bool {
    record.needs_sync && (filter_ids.is_empty() || filter_ids.contains(&record.external_id))
}

#[async_trait]
impl MirrorRepository for InMemoryMirrorRepository {
    async fn find(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<Option<MirrorRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&key(tenant_id, entity_type, external_id)).cloned())
    }

    async fn upsert(&self, record: &MirrorRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        records.insert(
            key(&record.tenant_id, record.entity_type, &record.external_id),
            record.clone(),
        );
        Ok(())
    }

    async fn count_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        filter_ids: &[String],
    ) -> anyhow::Result<u64> {
        let records = self.records.read().await;
        let count = records
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == entity_type)
            .filter(|r| is_pending(r, filter_ids))
            .count();
        Ok(count as u64)
    }

    async fn find_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        after: Option<String>,
        filter_ids: &[String],
        limit: u32,
    ) -> anyhow::Result<Vec<MirrorRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == entity_type)
            .filter(|r| after.as_ref().is_none_or(|a| r.external_id > *a))
            .filter(|r| is_pending(r, filter_ids))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_synced(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key(tenant_id, entity_type, external_id))
            .ok_or_else(|| anyhow::anyhow!("mirror record not found: {}", external_id))?;
        let now = Utc::now();
        record.needs_sync = false;
        record.synced_at = Some(now);
        record.updated_at = now;
        Ok(())
    }
}
