pub mod batch_job;
pub mod mirror_record;

pub use batch_job::{
    BatchJob, EntityType, JobKind, JobParameters, JobParametersPatch, JobProgress, JobResults,
    JobStatus, TransitionError,
};
pub use mirror_record::{ExternalRecord, MirrorRecord};
