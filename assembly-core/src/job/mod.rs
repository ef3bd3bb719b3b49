pub mod error;
pub mod journal;
pub mod manager;
pub mod models;
mod store;

pub use error::{JournalError, JournalResult, PipelineError, SetupError, ValidationError};
pub use journal::{SqliteJobJournal, SqliteJobJournalBuilder, TransitionRecord};
pub use manager::{validate_request, JobManager, ManagerSettings, Pipeline};
pub use models::{
    job_id_for, CancelOutcome, FailureKind, HealthPayload, Job, JobFailure, JobHandle,
    JobSnapshot, JobStatus, Segment, SegmentInput, SegmentStatus, SegmentSummary,
};
