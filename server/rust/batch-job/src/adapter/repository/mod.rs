pub mod batch_job_in_memory;
pub mod batch_job_postgres;
pub mod mirror_in_memory;
pub mod mirror_postgres;
pub mod tenant_directory_static;
