use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::entity::batch_job::EntityType;
use crate::domain::entity::mirror_record::MirrorRecord;
use crate::domain::repository::MirrorRepository;

/// MirrorPostgresRepository はPostgreSQL実装のミラーリポジトリ。
pub struct MirrorPostgresRepository {
    pool: PgPool,
}

impl MirrorPostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MirrorRepository for MirrorPostgresRepository {
    async fn find(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<Option<MirrorRecord>> {
        let row = sqlx::query_as::<_, MirrorRecordRow>(
            r#"
            SELECT tenant_id, entity_type, external_id, payload, needs_sync, synced_at, created_at, updated_at
            FROM batch.mirror_records
            WHERE tenant_id = $1 AND entity_type = $2 AND external_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type.to_string())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, record: &MirrorRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batch.mirror_records
                (tenant_id, entity_type, external_id, payload, needs_sync, synced_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, entity_type, external_id) DO UPDATE
            SET payload = EXCLUDED.payload,
                needs_sync = EXCLUDED.needs_sync,
                synced_at = EXCLUDED.synced_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.tenant_id)
        .bind(record.entity_type.to_string())
        .bind(&record.external_id)
        .bind(&record.payload)
        .bind(record.needs_sync)
        .bind(record.synced_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        filter_ids: &[String],
    ) -> anyhow::Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM batch.mirror_records
            WHERE tenant_id = $1 AND entity_type = $2 AND needs_sync
              AND (cardinality($3::text[]) = 0 OR external_id = ANY($3))
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type.to_string())
        .bind(filter_ids)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count)?)
    }

    async fn find_pending_sync(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        after: Option<String>,
        filter_ids: &[String],
        limit: u32,
    ) -> anyhow::Result<Vec<MirrorRecord>> {
        let rows = sqlx::query_as::<_, MirrorRecordRow>(
            r#"
            SELECT tenant_id, entity_type, external_id, payload, needs_sync, synced_at, created_at, updated_at
            FROM batch.mirror_records
            WHERE tenant_id = $1 AND entity_type = $2 AND needs_sync
              AND ($3::text IS NULL OR external_id COLLATE "C" > $3)
              AND (cardinality($4::text[]) = 0 OR external_id = ANY($4))
            ORDER BY external_id COLLATE "C"
            LIMIT $5
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type.to_string())
        .bind(after)
        .bind(filter_ids)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_synced(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE batch.mirror_records
            SET needs_sync = FALSE, synced_at = NOW(), updated_at = NOW()
            WHERE tenant_id = $1 AND entity_type = $2 AND external_id = $3
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type.to_string())
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("mirror record not found: {}", external_id);
        }
        Ok(())
    }
}

/// MirrorRecordRow はDB行からのマッピング用。
#[derive(sqlx::FromRow)]
struct MirrorRecordRow {
    tenant_id: String,
    entity_type: String,
    external_id: String,
    payload: serde_json::Value,
    needs_sync: bool,
    synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MirrorRecordRow> for MirrorRecord {
    type Error = anyhow::Error;

    fn try_from(row: MirrorRecordRow) -> anyhow::Result<Self> {
        Ok(MirrorRecord {
            tenant_id: row.tenant_id,
            entity_type: EntityType::from_str_value(&row.entity_type)?,
            external_id: row.external_id,
            payload: row.payload,
            needs_sync: row.needs_sync,
            synced_at: row.synced_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
