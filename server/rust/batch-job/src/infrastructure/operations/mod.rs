pub mod import;
pub mod sync;

use std::sync::Arc;

use crate::adapter::data_source::ExternalDataSource;
use crate::domain::entity::batch_job::{EntityType, JobKind};
use crate::domain::repository::MirrorRepository;
use crate::domain::service::OperationRegistry;

pub use import::ImportOperation;
pub use sync::SyncOperation;

/// 全エンティティ種別に import / sync オペレーションを登録したレジストリを作る。
pub fn default_registry(
    data_source: Arc<dyn ExternalDataSource>,
    mirror_repo: Arc<dyn MirrorRepository>,
) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    for entity_type in EntityType::ALL {
        registry.register(
            JobKind::Import,
            entity_type,
            Arc::new(ImportOperation::new(
                entity_type,
                data_source.clone(),
                mirror_repo.clone(),
            )),
        );
        registry.register(
            JobKind::Sync,
            entity_type,
            Arc::new(SyncOperation::new(
                entity_type,
                data_source.clone(),
                mirror_repo.clone(),
            )),
        );
    }
    registry
}
