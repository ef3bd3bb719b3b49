pub mod assembler;
pub mod command;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod prober;
pub mod retry;
pub mod timeline;
pub mod uploader;
pub mod workspace;

pub use assembler::{AssemblyError, Assembler};
pub use command::{CommandExecutor, SystemCommandExecutor};
pub use config::{
    load_assembler_config, AssemblerConfig, AssemblySection, FetchSection, LimitsSection,
    PathsSection, StoreKind, StoreSection, SystemSection, ToolsSection,
};
pub use error::{ConfigError, Result};
pub use fetcher::{FetchCause, FetchError, SegmentFetcher};
pub use job::{
    job_id_for, CancelOutcome, FailureKind, HealthPayload, Job, JobFailure, JobHandle,
    JobManager, JobSnapshot, JobStatus, JournalError, ManagerSettings, Pipeline, PipelineError,
    SegmentInput, SegmentStatus, SetupError, SqliteJobJournal, TransitionRecord,
    ValidationError,
};
pub use prober::{MediaProber, ProbeError};
pub use retry::{RetryPolicy, Transient};
pub use timeline::{
    format_timestamp, parse_srt, render_srt, MeasuredSegment, Timeline, TimelineBuilder,
    TimelineEntry, TimelineError,
};
pub use uploader::{
    ArtifactStore, HttpArtifactStore, LocalArtifactStore, StoreError, UploadError, Uploader,
};
pub use workspace::JobWorkspace;
