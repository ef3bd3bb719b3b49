use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::timeline::Timeline;

/// Stable job id for an episode: `job_` plus 16 hex digits of its SHA-256.
pub fn job_id_for(episode_id: &str) -> String {
    let digest = Sha256::digest(episode_id.as_bytes());
    format!("job_{}", &hex::encode(digest)[..16])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Fetching,
    Probing,
    BuildingTimeline,
    Assembling,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Fetching => "fetching",
            JobStatus::Probing => "probing",
            JobStatus::BuildingTimeline => "building_timeline",
            JobStatus::Assembling => "assembling",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Cancellation aborts work immediately only before assembly starts.
    pub fn cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Fetching | JobStatus::Probing | JobStatus::BuildingTimeline
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Fetching => 1,
            JobStatus::Probing => 2,
            JobStatus::BuildingTimeline => 3,
            JobStatus::Assembling => 4,
            JobStatus::Uploading => 5,
            JobStatus::Completed | JobStatus::Failed => 6,
        }
    }

    /// Forward moves along the pipeline, or a jump to Failed from any live state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            JobStatus::Completed => *self == JobStatus::Uploading,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "fetching" => Ok(JobStatus::Fetching),
            "probing" => Ok(JobStatus::Probing),
            "building_timeline" => Ok(JobStatus::BuildingTimeline),
            "assembling" => Ok(JobStatus::Assembling),
            "uploading" => Ok(JobStatus::Uploading),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Fetching,
    Fetched,
    Probing,
    Ready,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Fetching => "fetching",
            SegmentStatus::Fetched => "fetched",
            SegmentStatus::Probing => "probing",
            SegmentStatus::Ready => "ready",
            SegmentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One segment as submitted. The index is signed so malformed requests can
/// be represented and rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInput {
    pub index: i64,
    #[serde(alias = "video_url")]
    pub source_url: String,
    #[serde(alias = "text_content")]
    pub text: String,
}

impl SegmentInput {
    pub fn new(index: i64, source_url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            index,
            source_url: source_url.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub source_url: String,
    pub text: String,
    pub local_path: Option<PathBuf>,
    pub measured_duration_millis: Option<u64>,
    pub status: SegmentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Probe,
    Timeline,
    Assembly,
    Upload,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Probe => "probe",
            FailureKind::Timeline => "timeline",
            FailureKind::Assembly => "assembly",
            FailureKind::Upload => "upload",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    /// Status the job was in when it failed.
    pub stage: JobStatus,
    pub message: String,
    pub segment_index: Option<usize>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub episode_id: String,
    pub segments: Vec<Segment>,
    pub status: JobStatus,
    pub timeline: Option<Timeline>,
    pub result_ref: Option<String>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a queued job from inputs already checked to be `0..N-1`.
    pub(crate) fn queued(episode_id: &str, mut inputs: Vec<SegmentInput>) -> Self {
        inputs.sort_by_key(|input| input.index);
        let now = Utc::now();
        let segments = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| Segment {
                index,
                source_url: input.source_url,
                text: input.text,
                local_path: None,
                measured_duration_millis: None,
                status: SegmentStatus::Pending,
            })
            .collect();
        Self {
            id: job_id_for(episode_id),
            episode_id: episode_id.to_string(),
            segments,
            status: JobStatus::Queued,
            timeline: None,
            result_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the job to `next`. Returns false and leaves the job untouched
    /// when the move is not allowed.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn fail(&mut self, failure: JobFailure) -> bool {
        if self.status.terminal() {
            return false;
        }
        if let Some(index) = failure.segment_index {
            if let Some(segment) = self.segments.get_mut(index) {
                segment.status = SegmentStatus::Failed;
            }
        }
        self.status = JobStatus::Failed;
        self.error = Some(failure);
        self.updated_at = Utc::now();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            episode_id: self.episode_id.clone(),
            status: self.status,
            segments: self
                .segments
                .iter()
                .map(|segment| SegmentSummary {
                    index: segment.index,
                    status: segment.status,
                    duration_millis: segment.measured_duration_millis,
                })
                .collect(),
            total_duration_millis: self.timeline.as_ref().map(|t| t.total_duration_millis),
            result_ref: self.result_ref.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentSummary {
    pub index: usize,
    pub status: SegmentStatus,
    pub duration_millis: Option<u64>,
}

/// Read-only view handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub episode_id: String,
    pub status: JobStatus,
    pub segments: Vec<SegmentSummary>,
    pub total_duration_millis: Option<u64>,
    pub result_ref: Option<String>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub status: JobStatus,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// Recorded; takes effect at the next stage boundary.
    Deferred,
    AlreadyTerminal,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthPayload {
    pub status: &'static str,
    pub service: String,
}

impl HealthPayload {
    pub fn ok(service: impl Into<String>) -> Self {
        Self {
            status: "ok",
            service: service.into(),
        }
    }
}
