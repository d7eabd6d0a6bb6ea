pub mod cancel_job;
pub mod create_job;
pub mod execute_job;
pub mod get_job;
pub mod list_jobs;
pub mod pause_job;
pub mod progress_summary;
pub mod reap_stale_jobs;
pub mod resume_all_jobs;
pub mod resume_job;

pub use cancel_job::{CancelJobError, CancelJobUseCase};
pub use create_job::{BatchLimits, CreateJobError, CreateJobInput, CreateJobUseCase};
pub use execute_job::ExecuteJobUseCase;
pub use get_job::{GetJobUseCase, JobView};
pub use list_jobs::{JobPage, ListJobsUseCase};
pub use pause_job::{PauseJobError, PauseJobUseCase};
pub use progress_summary::{EntityProgress, ProgressSummary, ProgressSummaryUseCase, TimelineEntry};
pub use reap_stale_jobs::ReapStaleJobsUseCase;
pub use resume_all_jobs::{ResumeAllJobsError, ResumeAllJobsUseCase, ResumeOutcome};
pub use resume_job::{ResumeJobError, ResumeJobInput, ResumeJobUseCase};
