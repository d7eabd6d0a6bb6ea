use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::repository::TenantDirectory;
use crate::infrastructure::config::TenantConfig;

/// StaticTenantDirectory は設定ファイルのテナント一覧に基づく TenantDirectory 実装。
/// テナントが一つも設定されていない場合はすべて許可する（開発モード）。
pub struct StaticTenantDirectory {
    tenants: HashMap<String, TenantConfig>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: Vec<TenantConfig>) -> Self {
        if tenants.is_empty() {
            tracing::warn!("no tenants configured, tenant directory allows every credential");
        }
        Self {
            tenants: tenants.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn is_active_credential(
        &self,
        tenant_id: &str,
        credential_ref: &str,
    ) -> anyhow::Result<bool> {
        if self.tenants.is_empty() {
            return Ok(true);
        }
        Ok(self.tenants.get(tenant_id).is_some_and(|t| {
            t.active && t.credential_refs.iter().any(|c| c == credential_ref)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str, active: bool, credentials: &[&str]) -> TenantConfig {
        TenantConfig {
            id: id.to_string(),
            active,
            credential_refs: credentials.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_active_tenant_with_matching_credential() {
        let directory = StaticTenantDirectory::new(vec![
            tenant("tenant-a", true, &["acme"]),
            tenant("tenant-b", false, &["acme"]),
        ]);
        assert!(directory.is_active_credential("tenant-a", "acme").await.unwrap());
        assert!(!directory.is_active_credential("tenant-a", "other").await.unwrap());
        assert!(!directory.is_active_credential("tenant-b", "acme").await.unwrap());
        assert!(!directory.is_active_credential("tenant-c", "acme").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_directory_allows_all() {
        let directory = StaticTenantDirectory::new(vec![]);
        assert!(directory.is_active_credential("any", "any").await.unwrap());
    }
}
