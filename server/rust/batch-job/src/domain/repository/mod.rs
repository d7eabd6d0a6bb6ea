pub mod batch_job_repository;
pub mod mirror_repository;
pub mod tenant_directory;

pub use batch_job_repository::{BatchJobRepository, JobListParams};
pub use mirror_repository::MirrorRepository;
pub use tenant_directory::TenantDirectory;
