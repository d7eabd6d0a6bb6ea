use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, EntityType, JobKind, JobStatus};
use crate::domain::repository::{BatchJobRepository, JobListParams};

/// タイムラインに含めるジョブの最大件数。
pub const TIMELINE_LIMIT: i32 = 100;

/// EntityProgress はエンティティ種別ごとの最新ジョブの進捗。
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProgress {
    pub entity_type: EntityType,
    /// この種別のジョブが一度でも作成されていれば true。
    pub selected: bool,
    pub latest_job_id: Option<Uuid>,
    pub job_kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub processed: u64,
    pub total: Option<u64>,
    pub completion_percent: f64,
    /// only_selected のジョブで指定された ID 数。
    pub selected_ids: Option<usize>,
}

impl EntityProgress {
    fn unselected(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            selected: false,
            latest_job_id: None,
            job_kind: None,
            status: None,
            processed: 0,
            total: None,
            completion_percent: 0.0,
            selected_ids: None,
        }
    }

    fn from_job(job: &BatchJob) -> Self {
        let completion_percent = if job.status == JobStatus::Completed {
            100.0
        } else {
            job.progress.percent()
        };
        Self {
            entity_type: job.entity_type,
            selected: true,
            latest_job_id: Some(job.id),
            job_kind: Some(job.job_kind),
            status: Some(job.status),
            processed: job.progress.processed,
            total: job.progress.total,
            completion_percent,
            selected_ids: job
                .parameters
                .only_selected
                .then(|| job.parameters.normalized_selection().len()),
        }
    }
}

/// TimelineEntry は開始時刻順に並べたジョブの履歴。
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub job_id: Uuid,
    pub job_kind: JobKind,
    pub entity_type: EntityType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// ProgressSummary はテナント全体の進捗。
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub tenant_id: String,
    pub entities: Vec<EntityProgress>,
    /// ジョブが作成されたエンティティ種別の割合。
    pub selection_percent: f64,
    /// 最新ジョブが COMPLETED のエンティティ種別の割合。
    pub completion_percent: f64,
    pub timeline: Vec<TimelineEntry>,
}

/// ProgressSummaryUseCase はテナントの全エンティティ種別にまたがる進捗を集計する。
pub struct ProgressSummaryUseCase {
    job_repo: Arc<dyn BatchJobRepository>,
}

impl ProgressSummaryUseCase {
    pub fn new(job_repo: Arc<dyn BatchJobRepository>) -> Self {
        Self { job_repo }
    }

    /// job_kind を指定するとその種類のジョブだけを集計する。
    #[allow(clippy::cast_precision_loss)]
    pub async fn execute(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<ProgressSummary> {
        let latest: BTreeMap<EntityType, BatchJob> = self
            .job_repo
            .find_latest_per_entity_type(tenant_id, job_kind)
            .await?
            .into_iter()
            .map(|job| (job.entity_type, job))
            .collect();

        // タイムラインは新しく作成された TIMELINE_LIMIT 件に限る
        let params = JobListParams {
            tenant_id: Some(tenant_id.to_string()),
            job_kind,
            page: 1,
            page_size: TIMELINE_LIMIT,
            ..Default::default()
        };
        let (jobs, _) = self.job_repo.list(&params).await?;

        let entities: Vec<EntityProgress> = EntityType::ALL
            .iter()
            .map(|entity_type| {
                latest
                    .get(entity_type)
                    .map_or_else(|| EntityProgress::unselected(*entity_type), |job| EntityProgress::from_job(job))
            })
            .collect();

        let type_count = EntityType::ALL.len() as f64;
        let selected = entities.iter().filter(|e| e.selected).count() as f64;
        let completed = entities
            .iter()
            .filter(|e| e.status == Some(JobStatus::Completed))
            .count() as f64;

        let mut timeline: Vec<TimelineEntry> = jobs
            .iter()
            .filter_map(|job| {
                job.started_at.map(|started_at| TimelineEntry {
                    job_id: job.id,
                    job_kind: job.job_kind,
                    entity_type: job.entity_type,
                    status: job.status,
                    started_at,
                    paused_at: job.paused_at,
                    completed_at: job.completed_at,
                })
            })
            .collect();
        timeline.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        Ok(ProgressSummary {
            tenant_id: tenant_id.to_string(),
            entities,
            selection_percent: selected / type_count * 100.0,
            completion_percent: completed / type_count * 100.0,
            timeline,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::adapter::repository::batch_job_in_memory::InMemoryBatchJobRepository;
    use crate::domain::entity::batch_job::JobResults;
    use crate::domain::repository::batch_job_repository::MockBatchJobRepository;
    use crate::test_support::make_parameters;

    fn make_job(entity_type: EntityType, minutes_ago: i64) -> BatchJob {
        let mut job = BatchJob::new(
            JobKind::Import,
            entity_type,
            "tenant-1".to_string(),
            make_parameters("acme", 10),
        );
        let at = Utc::now() - Duration::minutes(minutes_ago);
        job.created_at = at;
        job.started_at = Some(at);
        job
    }

    #[tokio::test]
    async fn test_summary_uses_latest_job_per_entity_type() {
        let repo = Arc::new(InMemoryBatchJobRepository::new());

        let mut old_merchant = make_job(EntityType::Merchant, 60);
        old_merchant.status = JobStatus::Failed;
        let mut merchant = make_job(EntityType::Merchant, 10);
        merchant.status = JobStatus::Completed;
        merchant.progress.processed = 45;
        merchant.progress.total = Some(45);
        merchant.results = Some(JobResults {
            created: 45,
            ..Default::default()
        });
        let mut lender = make_job(EntityType::Lender, 30);
        lender.status = JobStatus::Paused;
        lender.progress.processed = 25;
        lender.progress.total = Some(100);
        lender.parameters.only_selected = true;
        lender.parameters.selected_ids = vec!["l-2".to_string(), "l-1".to_string(), "l-1".to_string()];
        let mut pending_iso = BatchJob::new(
            JobKind::Import,
            EntityType::Iso,
            "tenant-1".to_string(),
            make_parameters("acme", 10),
        );
        pending_iso.created_at = Utc::now();
        let other_tenant = BatchJob::new(
            JobKind::Import,
            EntityType::User,
            "tenant-2".to_string(),
            make_parameters("acme", 10),
        );
        for job in [&old_merchant, &merchant, &lender, &pending_iso, &other_tenant] {
            repo.create(job).await.unwrap();
        }

        let uc = ProgressSummaryUseCase::new(repo);
        let summary = uc.execute("tenant-1", None).await.unwrap();

        assert_eq!(summary.entities.len(), EntityType::ALL.len());
        let by_type = |et: EntityType| summary.entities.iter().find(|e| e.entity_type == et).unwrap();

        let merchant_progress = by_type(EntityType::Merchant);
        assert_eq!(merchant_progress.latest_job_id, Some(merchant.id));
        assert!((merchant_progress.completion_percent - 100.0).abs() < f64::EPSILON);

        let lender_progress = by_type(EntityType::Lender);
        assert!((lender_progress.completion_percent - 25.0).abs() < f64::EPSILON);
        assert_eq!(lender_progress.selected_ids, Some(2));

        assert!(by_type(EntityType::Iso).selected);
        assert!(!by_type(EntityType::User).selected);

        // 8 種別中 3 種別にジョブがあり、1 種別が完了
        assert!((summary.selection_percent - 37.5).abs() < f64::EPSILON);
        assert!((summary.completion_percent - 12.5).abs() < f64::EPSILON);

        let order: Vec<Uuid> = summary.timeline.iter().map(|t| t.job_id).collect();
        assert_eq!(order, vec![old_merchant.id, lender.id, merchant.id]);
    }

    #[tokio::test]
    async fn test_summary_for_unknown_tenant_is_empty() {
        let repo = Arc::new(InMemoryBatchJobRepository::new());
        let uc = ProgressSummaryUseCase::new(repo);
        let summary = uc.execute("nobody", Some(JobKind::Sync)).await.unwrap();
        assert!(summary.entities.iter().all(|e| !e.selected));
        assert!(summary.timeline.is_empty());
        assert!(summary.selection_percent.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_summary_reads_latest_jobs_and_a_bounded_timeline() {
        let mut merchant = make_job(EntityType::Merchant, 5);
        merchant.status = JobStatus::Running;
        let latest = vec![merchant.clone()];

        let mut mock = MockBatchJobRepository::new();
        mock.expect_find_latest_per_entity_type()
            .withf(|tenant_id, job_kind| tenant_id == "tenant-1" && *job_kind == Some(JobKind::Import))
            .times(1)
            .returning(move |_, _| Ok(latest.clone()));
        mock.expect_list()
            .withf(|params| params.page == 1 && params.page_size == TIMELINE_LIMIT)
            .times(1)
            .returning(move |_| Ok((vec![merchant.clone()], 1)));

        let uc = ProgressSummaryUseCase::new(Arc::new(mock));
        let summary = uc.execute("tenant-1", Some(JobKind::Import)).await.unwrap();
        assert_eq!(summary.timeline.len(), 1);
        assert!((summary.selection_percent - 12.5).abs() < f64::EPSILON);
        assert!(summary.completion_percent.abs() < f64::EPSILON);
    }
}
