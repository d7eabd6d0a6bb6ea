use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;

use super::ExternalDataSource;
use crate::domain::entity::batch_job::EntityType;
use crate::domain::entity::mirror_record::ExternalRecord;

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<Value>,
}

/// HttpDataSource は REST API 経由の ExternalDataSource 実装。
/// credential_ref ごとの API キーを Bearer トークンとして送る。
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
    credentials: HashMap<String, Secret<String>>,
}

impl HttpDataSource {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: HashMap<String, Secret<String>>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn api_key(&self, credential_ref: &str) -> anyhow::Result<&str> {
        self.credentials
            .get(credential_ref)
            .map(|key| key.expose_secret().as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown credential_ref: {}", credential_ref))
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/{}", self.base_url, entity_type.collection())
    }

    async fn fetch_list(
        &self,
        credential_ref: &str,
        url: &str,
        query: &[(&str, String)],
        first_position: u64,
    ) -> anyhow::Result<Vec<ExternalRecord>> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.api_key(credential_ref)?)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        let list: ListResponse = response.json().await?;
        Ok(list
            .data
            .into_iter()
            .zip(first_position..)
            .map(|(value, position)| to_record(value, position))
            .collect())
    }
}

/// id を持たない要素はページ全体を失敗させず、位置ベースの仮 ID で不正レコードにする。
fn to_record(value: Value, position: u64) -> ExternalRecord {
    let external_id = match value.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    match external_id {
        Some(id) => ExternalRecord::new(id, value),
        None => {
            tracing::warn!(position, "external record has no id field");
            ExternalRecord::malformed(position, "external record has no id field", value)
        }
    }
}

#[async_trait]
impl ExternalDataSource for HttpDataSource {
    async fn test_connection(&self, credential_ref: &str) -> anyhow::Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key(credential_ref)?)
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!(
                credential_ref = %credential_ref,
                status = %response.status(),
                "external data source health check failed"
            );
        }
        Ok(response.status().is_success())
    }

    async fn count(&self, credential_ref: &str, entity_type: EntityType) -> anyhow::Result<u64> {
        let url = format!("{}/count", self.collection_url(entity_type));
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.api_key(credential_ref)?)
            .send()
            .await?
            .error_for_status()?;
        let body: CountResponse = response
            .json()
            .await
            .with_context(|| format!("invalid count response for {entity_type}"))?;
        Ok(body.count)
    }

    async fn fetch_page(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        offset: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<ExternalRecord>> {
        let url = self.collection_url(entity_type);
        let query = [
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
            ("sort", "id".to_string()),
        ];
        self.fetch_list(credential_ref, &url, &query, offset).await
    }

    async fn fetch_by_ids(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        ids: &[String],
    ) -> anyhow::Result<Vec<ExternalRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.collection_url(entity_type);
        let query = [("ids", ids.join(",")), ("sort", "id".to_string())];
        self.fetch_list(credential_ref, &url, &query, 0).await
    }

    async fn push_record(
        &self,
        credential_ref: &str,
        entity_type: EntityType,
        record: &ExternalRecord,
    ) -> anyhow::Result<()> {
        let mut url = reqwest::Url::parse(&self.collection_url(entity_type))
            .with_context(|| format!("invalid data source url: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("data source url cannot be a base: {}", self.base_url))?
            .push(&record.external_id);
        let response = self
            .client
            .put(url)
            .bearer_auth(self.api_key(credential_ref)?)
            .json(&record.payload)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("external system rejected {}: {} {}", record.external_id, status, body)
    }
}
