use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::entity::batch_job::{BatchJob, EntityType, JobKind, JobProgress, JobStatus};
use crate::domain::repository::{BatchJobRepository, JobListParams};

/// InMemoryBatchJobRepository はインメモリのバッチジョブリポジトリ。
/// データベース未設定の開発モードとテストで使う。
pub struct InMemoryBatchJobRepository {
    jobs: RwLock<HashMap<Uuid, BatchJob>>,
}

impl InMemoryBatchJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBatchJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchJobRepository for InMemoryBatchJobRepository {
    async fn create(&self, job: &BatchJob) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            anyhow::bail!("batch job already exists: {}", job.id);
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<BatchJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_active(
        &self,
        entity_type: EntityType,
        tenant_id: &str,
    ) -> anyhow::Result<Option<BatchJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.entity_type == entity_type && j.tenant_id == tenant_id && j.is_active())
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn find_latest_per_entity_type(
        &self,
        tenant_id: &str,
        job_kind: Option<JobKind>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        let jobs = self.jobs.read().await;
        let mut latest: HashMap<EntityType, &BatchJob> = HashMap::new();
        for job in jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && job_kind.map_or(true, |k| j.job_kind == k))
        {
            latest
                .entry(job.entity_type)
                .and_modify(|current| {
                    if (job.created_at, job.id) > (current.created_at, current.id) {
                        *current = job;
                    }
                })
                .or_insert(job);
        }
        let mut found: Vec<BatchJob> = latest.into_values().cloned().collect();
        found.sort_by_key(|j| j.entity_type);
        Ok(found)
    }

    async fn list(&self, params: &JobListParams) -> anyhow::Result<(Vec<BatchJob>, i64)> {
        let jobs = self.jobs.read().await;
        let mut filtered: Vec<BatchJob> = jobs
            .values()
            .filter(|j| params.matches(j))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = i64::try_from(filtered.len())?;
        let page = usize::try_from(params.page.max(1)).unwrap_or(1);
        let page_size = usize::try_from(params.page_size.max(1)).unwrap_or(1);
        let offset = (page - 1).saturating_mul(page_size);
        let paged = filtered.into_iter().skip(offset).take(page_size).collect();

        Ok((paged, total))
    }

    async fn count_by_status(
        &self,
        params: &JobListParams,
    ) -> anyhow::Result<HashMap<JobStatus, i64>> {
        let scope = JobListParams {
            statuses: Vec::new(),
            ..params.clone()
        };
        let jobs = self.jobs.read().await;
        let mut counts = HashMap::new();
        for job in jobs.values().filter(|j| scope.matches(j)) {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                let now = Utc::now();
                job.progress = progress.clone();
                job.heartbeat_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_if_status(
        &self,
        job: &BatchJob,
        expected: &[JobStatus],
    ) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(current) if expected.contains(&current.status) => {
                let mut next = job.clone();
                if current.status == JobStatus::Running {
                    next.progress = current.progress.clone();
                    next.heartbeat_at = current.heartbeat_at;
                }
                *current = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_running(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<BatchJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.heartbeat_at.or(j.started_at).unwrap_or(j.created_at) < heartbeat_before
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domain::entity::batch_job::{JobKind, JobParameters};

    fn make_job(entity_type: EntityType, tenant_id: &str) -> BatchJob {
        BatchJob::new(
            JobKind::Import,
            entity_type,
            tenant_id.to_string(),
            JobParameters {
                credential_ref: "acme".to_string(),
                batch_size: 10,
                update_existing: false,
                only_selected: false,
                selected_ids: vec![],
                dry_run: false,
            },
        )
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let repo = InMemoryBatchJobRepository::new();
        let job = make_job(EntityType::Merchant, "tenant-a");
        repo.create(&job).await.unwrap();
        assert!(repo.create(&job).await.is_err());

        let found = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(repo.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_active_ignores_terminal_jobs() {
        let repo = InMemoryBatchJobRepository::new();
        let mut done = make_job(EntityType::Merchant, "tenant-a");
        done.start().unwrap();
        done.complete(Default::default()).unwrap();
        repo.create(&done).await.unwrap();
        assert!(repo
            .find_active(EntityType::Merchant, "tenant-a")
            .await
            .unwrap()
            .is_none());

        let active = make_job(EntityType::Merchant, "tenant-a");
        repo.create(&active).await.unwrap();
        let found = repo
            .find_active(EntityType::Merchant, "tenant-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, active.id);
        assert!(repo
            .find_active(EntityType::Merchant, "tenant-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_progress_only_while_running() {
        let repo = InMemoryBatchJobRepository::new();
        let mut job = make_job(EntityType::Lender, "tenant-a");
        repo.create(&job).await.unwrap();

        let progress = JobProgress {
            processed: 10,
            total: Some(30),
            current_entity: Some("l-009".to_string()),
            last_progress_update: Some(Utc::now()),
        };
        assert!(!repo.update_progress(job.id, &progress).await.unwrap());

        job.start().unwrap();
        assert!(repo
            .update_if_status(&job, &[JobStatus::Pending])
            .await
            .unwrap());
        assert!(repo.update_progress(job.id, &progress).await.unwrap());

        let stored = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.processed, 10);
        assert!(stored.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_update_if_status_is_compare_and_set() {
        let repo = InMemoryBatchJobRepository::new();
        let job = make_job(EntityType::Iso, "tenant-a");
        repo.create(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.cancel().unwrap();
        assert!(repo
            .update_if_status(&cancelled, &[JobStatus::Pending])
            .await
            .unwrap());

        let mut started = job.clone();
        started.start().unwrap();
        assert!(!repo
            .update_if_status(&started, &[JobStatus::Pending])
            .await
            .unwrap());
        let stored = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_if_status_keeps_progress_of_running_job() {
        let repo = InMemoryBatchJobRepository::new();
        let mut job = make_job(EntityType::Iso, "tenant-a");
        job.start().unwrap();
        repo.create(&job).await.unwrap();

        // 古いスナップショットからのキャンセル
        let mut stale = job.clone();
        let progress = JobProgress {
            processed: 40,
            total: Some(45),
            ..Default::default()
        };
        assert!(repo.update_progress(job.id, &progress).await.unwrap());
        stale.cancel().unwrap();
        assert!(repo
            .update_if_status(&stale, &[JobStatus::Running])
            .await
            .unwrap());

        let stored = repo.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.progress.processed, 40);
    }

    #[tokio::test]
    async fn test_list_filters_and_counts() {
        let repo = InMemoryBatchJobRepository::new();
        for entity_type in [EntityType::Merchant, EntityType::Lender, EntityType::Iso] {
            repo.create(&make_job(entity_type, "tenant-a")).await.unwrap();
        }
        let mut cancelled = make_job(EntityType::Advance, "tenant-a");
        cancelled.cancel().unwrap();
        repo.create(&cancelled).await.unwrap();
        repo.create(&make_job(EntityType::Merchant, "tenant-b"))
            .await
            .unwrap();

        let params = JobListParams {
            tenant_id: Some("tenant-a".to_string()),
            page: 1,
            page_size: 2,
            ..Default::default()
        };
        let (page, total) = repo.list(&params).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(page.len(), 2);

        let pending_only = JobListParams {
            statuses: vec![JobStatus::Pending],
            ..params.clone()
        };
        let (_, total) = repo.list(&pending_only).await.unwrap();
        assert_eq!(total, 3);

        let counts = repo.count_by_status(&pending_only).await.unwrap();
        assert_eq!(counts[&JobStatus::Pending], 3);
        assert_eq!(counts[&JobStatus::Cancelled], 1);
    }

    #[tokio::test]
    async fn test_find_stale_running() {
        let repo = InMemoryBatchJobRepository::new();
        let mut stale = make_job(EntityType::Merchant, "tenant-a");
        stale.start().unwrap();
        stale.heartbeat_at = Some(Utc::now() - Duration::minutes(30));
        repo.create(&stale).await.unwrap();

        let mut fresh = make_job(EntityType::Lender, "tenant-a");
        fresh.start().unwrap();
        repo.create(&fresh).await.unwrap();

        let found = repo
            .find_stale_running(Utc::now() - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }

    #[tokio::test]
    async fn test_find_latest_per_entity_type() {
        let repo = InMemoryBatchJobRepository::new();
        let mut old = make_job(EntityType::Merchant, "tenant-a");
        old.created_at = Utc::now() - Duration::hours(2);
        let newest = make_job(EntityType::Merchant, "tenant-a");
        let mut sync = make_job(EntityType::Lender, "tenant-a");
        sync.job_kind = JobKind::Sync;
        let other_tenant = make_job(EntityType::Iso, "tenant-b");
        for job in [&old, &newest, &sync, &other_tenant] {
            repo.create(job).await.unwrap();
        }

        let latest = repo
            .find_latest_per_entity_type("tenant-a", None)
            .await
            .unwrap();
        let ids: Vec<Uuid> = latest.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![sync.id, newest.id]);

        let imports = repo
            .find_latest_per_entity_type("tenant-a", Some(JobKind::Import))
            .await
            .unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].id, newest.id);
    }
}
