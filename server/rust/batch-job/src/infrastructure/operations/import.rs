use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapter::data_source::ExternalDataSource;
use crate::domain::entity::batch_job::{EntityType, JobParameters};
use crate::domain::entity::mirror_record::{ExternalRecord, MirrorRecord};
use crate::domain::repository::MirrorRepository;
use crate::domain::service::{
    EntityOperation, OperationContext, OperationError, OperationSummary, ProgressReporter,
};

/// ImportOperation は外部システムのエンティティをテナントのミラーへ取り込む。
///
/// 通常は外部 API を external_id 昇順で offset/limit ページングする。
/// only_selected の場合は昇順に並べた selected_ids を同じ要領で区切って取得する。
pub struct ImportOperation {
    entity_type: EntityType,
    data_source: Arc<dyn ExternalDataSource>,
    mirror_repo: Arc<dyn MirrorRepository>,
}

impl ImportOperation {
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

    /// 1 件取り込む。ストレージ障害のみ Err として呼び出し元へ返す。
    async fn import_one(
        &self,
        ctx: &OperationContext,
        record: &ExternalRecord,
        summary: &mut OperationSummary,
    ) -> anyhow::Result<()> {
        if let Some(defect) = &record.defect {
            summary.record_failure(&record.external_id, defect);
            return Ok(());
        }
        if !record.payload.is_object() {
            summary.record_failure(&record.external_id, "payload is not a JSON object");
            return Ok(());
        }

        let existing = self
            .mirror_repo
            .find(&ctx.tenant_id, self.entity_type, &record.external_id)
            .await
            .with_context(|| format!("failed to look up mirror record {}", record.external_id))?;

        let is_update = existing.is_some();
        if is_update && !ctx.parameters.update_existing {
            summary.skipped += 1;
            return Ok(());
        }

        if !ctx.parameters.dry_run {
            let mirror = MirrorRecord::from_external(
                &ctx.tenant_id,
                self.entity_type,
                record,
                existing.as_ref(),
            );
            self.mirror_repo
                .upsert(&mirror)
                .await
                .with_context(|| format!("failed to store mirror record {}", record.external_id))?;
        }

        if is_update {
            summary.updated += 1;
        } else {
            summary.created += 1;
        }
        Ok(())
    }

    /// 1 バッチ分を取得する。戻り値の u64 はこのバッチで消費した位置数。
    async fn fetch_batch(
        &self,
        ctx: &OperationContext,
        selection: Option<&[String]>,
        offset: u64,
        limit: u64,
        summary: &mut OperationSummary,
    ) -> anyhow::Result<(Vec<ExternalRecord>, u64)> {
        let credential_ref = &ctx.parameters.credential_ref;
        match selection {
            Some(ids) => {
                let window = selection_window(ids, offset, limit);
                let mut records = self
                    .data_source
                    .fetch_by_ids(credential_ref, self.entity_type, window)
                    .await
                    .with_context(|| {
                        format!("failed to fetch selected {} records", self.entity_type)
                    })?;
                // 選択 ID と突き合わせられない要素は下の not found で計上される
                records.retain(|r| !r.is_malformed());
                for id in window {
                    if !records.iter().any(|r| r.external_id == *id) {
                        summary.record_failure(id, "not found in external system");
                    }
                }
                Ok((records, window.len() as u64))
            }
            None => {
                let page_limit = u32::try_from(limit).unwrap_or(u32::MAX);
                let records = self
                    .data_source
                    .fetch_page(credential_ref, self.entity_type, offset, page_limit)
                    .await
                    .with_context(|| {
                        format!(
                            "failed to fetch {} page at offset {}",
                            self.entity_type, offset
                        )
                    })?;
                let consumed = (records.len() as u64).min(limit);
                Ok((records, consumed))
            }
        }
    }
}

fn selection_window(ids: &[String], offset: u64, limit: u64) -> &[String] {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(ids.len());
    let end = start
        .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
        .min(ids.len());
    &ids[start..end]
}

#[async_trait]
impl EntityOperation for ImportOperation {
    async fn count(&self, _tenant_id: &str, parameters: &JobParameters) -> anyhow::Result<u64> {
        if parameters.only_selected {
            return Ok(parameters.normalized_selection().len() as u64);
        }
        self.data_source
            .count(&parameters.credential_ref, self.entity_type)
            .await
            .with_context(|| format!("failed to count external {} records", self.entity_type))
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        reporter: &dyn ProgressReporter,
    ) -> Result<OperationSummary, OperationError> {
        let mut summary = OperationSummary::default();
        let batch_size = u64::from(ctx.parameters.batch_size.max(1));
        let remaining = ctx.remaining();
        let selection = ctx
            .parameters
            .only_selected
            .then(|| ctx.parameters.normalized_selection());

        let mut done = 0u64;
        while done < remaining {
            let limit = batch_size.min(remaining - done);
            let offset = ctx.resume_from_index + done;
            let (records, consumed) = self
                .fetch_batch(ctx, selection.as_deref(), offset, limit, &mut summary)
                .await?;
            if consumed == 0 {
                warn!(
                    job_id = %ctx.job_id,
                    entity_type = %self.entity_type,
                    offset,
                    "external source returned fewer records than counted"
                );
                break;
            }

            for record in records.iter().take(usize::try_from(limit).unwrap_or(usize::MAX)) {
                self.import_one(ctx, record, &mut summary).await?;
            }

            done += consumed;
            let current_entity = records.last().map(|r| r.external_id.clone());
            debug!(job_id = %ctx.job_id, done, remaining, "import batch processed");
            reporter.report(done, current_entity).await?;
        }

        Ok(summary)
    }
}
