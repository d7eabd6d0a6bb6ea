use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapter::data_source::ExternalDataSource;
use crate::domain::entity::batch_job::{EntityType, JobParameters};
use crate::domain::repository::MirrorRepository;
use crate::domain::service::{
    EntityOperation, OperationContext, OperationError, OperationSummary, ProgressReporter,
};

/// SyncOperation はローカルで変更されたミラーレコードを外部システムへ反映する。
///
/// 未反映レコードは同期済みになると対象集合から外れるため、offset ではなく
/// external_id のキーセットで昇順に走査する。resume 時も未反映集合の先頭から再開し、
/// 処理件数は remaining() を上限とする。
pub struct SyncOperation {
    entity_type: EntityType,
    data_source: Arc<dyn ExternalDataSource>,
    mirror_repo: Arc<dyn MirrorRepository>,
}

impl SyncOperation {
    pub fn new(
        entity_type: EntityType,
        data_source: Arc<dyn ExternalDataSource>,
        mirror_repo: Arc<dyn MirrorRepository>,
    ) -> Self {
        Self {
            entity_type,
            data_source,
            mirror_repo,
        }
    }

    fn filter_ids(parameters: &JobParameters) -> Vec<String> {
        if parameters.only_selected {
            parameters.normalized_selection()
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl EntityOperation for SyncOperation {
    async fn count(&self, tenant_id: &str, parameters: &JobParameters) -> anyhow::Result<u64> {
        self.mirror_repo
            .count_pending_sync(tenant_id, self.entity_type, &Self::filter_ids(parameters))
            .await
            .with_context(|| format!("failed to count pending {} records", self.entity_type))
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary, OperationError> {
        let mut summary = OperationSummary::default();
        let batch_size = u64::from(ctx.parameters.batch_size.max(1));
        let remaining = ctx.remaining();
        let filter_ids = Self::filter_ids(&ctx.parameters);
        let credential_ref = &ctx.parameters.credential_ref;

        let mut cursor: Option<String> = None;
        let mut done = 0u64;
        while done < remaining {
            let limit = u32::try_from(batch_size.min(remaining - done)).unwrap_or(u32::MAX);
            let rows = self
                .mirror_repo
                .find_pending_sync(
                    &ctx.tenant_id,
                    self.entity_type,
                    cursor.clone(),
                    &filter_ids,
                    limit,
                )
                .await
                .with_context(|| format!("failed to read pending {} records", self.entity_type))?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                if ctx.parameters.dry_run {
                    summary.skipped += 1;
                    continue;
                }
                match self
                    .data_source
                    .push_record(credential_ref, self.entity_type, &row.to_external())
                    .await
                {
                    Ok(()) => {
                        self.mirror_repo
                            .mark_synced(&ctx.tenant_id, self.entity_type, &row.external_id)
                            .await
                            .with_context(|| {
                                format!("failed to mark {} as synced", row.external_id)
                            })?;
                        summary.updated += 1;
                    }
                    Err(e) => {
                        warn!(
                            job_id = %ctx.job_id,
                            external_id = %row.external_id,
                            error = %e,
                            "failed to push record to external system"
                        );
                        summary.record_failure(&row.external_id, e.to_string());
                    }
                }
            }

            done += rows.len() as u64;
            cursor = rows.last().map(|r| r.external_id.clone());
            debug!(job_id = %ctx.job_id, done, remaining, "sync batch processed");
            reporter.report(done, cursor.clone()).await?;
        }

        Ok(summary)
    }
}
