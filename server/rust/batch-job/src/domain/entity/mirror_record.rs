use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch_job::EntityType;

/// ExternalRecord は外部データソース上の 1 エンティティ。
///
/// defect が Some のレコードは外部の応答が壊れていたことを示す。
/// external_id はページ内位置から作った仮の値で、取り込みではエンティティ単位の失敗として扱う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_id: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect: Option<String>,
}

impl ExternalRecord {
    pub fn new(external_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            external_id: external_id.into(),
            payload,
            defect: None,
        }
    }

    /// 位置 position の要素を不正レコードとして表す。仮 ID は `#<position>`。
    pub fn malformed(position: u64, reason: &str, payload: serde_json::Value) -> Self {
        Self {
            external_id: format!("#{position}"),
            payload,
            defect: Some(reason.to_string()),
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.defect.is_some()
    }
}

/// MirrorRecord は外部エンティティのテナント別ローカルコピー。
/// needs_sync はローカルで変更され、外部へ未反映であることを示す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub external_id: String,
    pub payload: serde_json::Value,
    pub needs_sync: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MirrorRecord {
    /// 取り込み結果からミラーレコードを作る。既存レコードがあれば created_at を引き継ぐ。
    pub fn from_external(
        tenant_id: &str,
        entity_type: EntityType,
        record: &ExternalRecord,
        existing: Option<&MirrorRecord>,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.to_string(),
            entity_type,
            external_id: record.external_id.clone(),
            payload: record.payload.clone(),
            needs_sync: false,
            synced_at: Some(now),
            created_at: existing.map_or(now, |e| e.created_at),
            updated_at: now,
        }
    }

    pub fn to_external(&self) -> ExternalRecord {
        ExternalRecord::new(self.external_id.clone(), self.payload.clone())
    }
}
