use std::collections::HashMap;
use std::sync::Arc;

use super::entity_operation::EntityOperation;
use crate::domain::entity::batch_job::{EntityType, JobKind};

/// OperationRegistry は (JobKind, EntityType) からオペレーションを引くディスパッチテーブル。
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<(JobKind, EntityType), Arc<dyn EntityOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同じキーへの再登録は上書きになる。
    pub fn register(
        &mut self,
        job_kind: JobKind,
        entity_type: EntityType,
        operation: Arc<dyn EntityOperation>,
    ) {
        self.operations.insert((job_kind, entity_type), operation);
    }

    pub fn get(&self, job_kind: JobKind, entity_type: EntityType) -> Option<Arc<dyn EntityOperation>> {
        self.operations.get(&(job_kind, entity_type)).cloned()
    }

    pub fn supports(&self, job_kind: JobKind, entity_type: EntityType) -> bool {
        self.operations.contains_key(&(job_kind, entity_type))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
