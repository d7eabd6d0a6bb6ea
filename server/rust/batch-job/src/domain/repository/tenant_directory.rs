use async_trait::async_trait;

/// TenantDirectory はテナントと外部接続情報の対応を管理する。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// テナントが credential_ref を利用可能かを返す。
    async fn is_active_credential(
        &self,
        tenant_id: &str,
        credential_ref: &str,
    ) -> anyhow::Result<bool>;
}
