use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::error::{PipelineError, SetupError, ValidationError};
use super::journal::{JournalWriter, SqliteJobJournal};
use super::models::{
    job_id_for, CancelOutcome, HealthPayload, Job, JobFailure, JobHandle, JobSnapshot, JobStatus,
    SegmentInput, SegmentStatus,
};
use super::store::{Admission, JobEntry, JobStore};
use crate::assembler::Assembler;
use crate::command::CommandExecutor;
use crate::config::AssemblerConfig;
use crate::fetcher::SegmentFetcher;
use crate::prober::MediaProber;
use crate::timeline::{MeasuredSegment, TimelineBuilder};
use crate::uploader::{store_from_config, Uploader};
use crate::workspace::JobWorkspace;

const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "file"];

/// The stage components a job runs through.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub fetcher: SegmentFetcher,
    pub prober: MediaProber,
    pub assembler: Assembler,
    pub uploader: Uploader,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub service_name: String,
    pub work_dir: PathBuf,
    pub max_concurrent_segments: usize,
}

/// Store key for a finished episode. The episode id is reduced to a single
/// path-safe segment; the job id and a fresh uuid keep reruns apart.
fn artifact_key(episode_id: &str, job_id: &str) -> String {
    let slug: String = episode_id
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{slug}/{job_id}-{}.mp4", Uuid::new_v4())
}

/// Checks a request before any job state exists for it.
pub fn validate_request(episode_id: &str, segments: &[SegmentInput]) -> Result<(), ValidationError> {
    if episode_id.trim().is_empty() {
        return Err(ValidationError::EmptyEpisodeId);
    }
    if segments.is_empty() {
        return Err(ValidationError::NoSegments);
    }
    let mut seen = HashSet::with_capacity(segments.len());
    for segment in segments {
        if segment.index < 0 {
            return Err(ValidationError::NegativeIndex(segment.index));
        }
        if !seen.insert(segment.index) {
            return Err(ValidationError::DuplicateIndex(segment.index));
        }
        let invalid = |reason: String| ValidationError::InvalidSourceUrl {
            index: segment.index,
            url: segment.source_url.clone(),
            reason,
        };
        let url = Url::parse(&segment.source_url).map_err(|err| invalid(err.to_string()))?;
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if url.scheme() != "file" && url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".into()));
        }
    }
    if let Some(missing) = (0..segments.len()).find(|index| !seen.contains(&(*index as i64))) {
        return Err(ValidationError::MissingIndex(missing));
    }
    Ok(())
}

enum StepOutcome {
    Fetched { index: usize, path: PathBuf },
    Probed { index: usize, duration_millis: u64 },
}

type Step<'a> = BoxFuture<'a, Result<StepOutcome, PipelineError>>;

/// Accepts assembly requests and drives each one on its own task.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    settings: ManagerSettings,
    pipeline: Pipeline,
    journal: Option<JournalWriter>,
    store: JobStore,
}

impl JobManager {
    pub fn new(
        settings: ManagerSettings,
        pipeline: Pipeline,
        journal: Option<SqliteJobJournal>,
    ) -> Self {
        let journal = journal.and_then(|journal| match JournalWriter::spawn(journal) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!(error = %err, "failed to start journal writer; transitions will not be journaled");
                None
            }
        });
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                pipeline,
                journal,
                store: JobStore::default(),
            }),
        }
    }

    pub fn from_config(
        config: &AssemblerConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let fetcher = SegmentFetcher::from_config(&config.fetch)?;
        let prober = MediaProber::new(
            config.tools.ffprobe.clone(),
            Duration::from_secs(config.tools.probe_timeout_seconds),
            executor.clone(),
        );
        let assembler =
            Assembler::new(&config.tools, &config.assembly, executor).with_prober(prober.clone());
        let store_client = Client::builder()
            .user_agent(config.fetch.user_agent.clone())
            .build()?;
        let uploader = Uploader::new(
            store_from_config(&config.store, store_client)?,
            config.store.retry_policy(),
        );
        let journal = match &config.paths.journal_db {
            Some(path) => {
                let journal = SqliteJobJournal::new(path)?;
                journal.initialize()?;
                Some(journal)
            }
            None => None,
        };
        let settings = ManagerSettings {
            service_name: config.system.service_name.clone(),
            work_dir: config.paths.work_dir.clone(),
            max_concurrent_segments: config.limits.max_concurrent_segments,
        };
        Ok(Self::new(
            settings,
            Pipeline {
                fetcher,
                prober,
                assembler,
                uploader,
            },
            journal,
        ))
    }

    pub fn health(&self) -> HealthPayload {
        HealthPayload::ok(self.inner.settings.service_name.as_str())
    }

    /// Registers a job and starts it in the background. Must be called from
    /// within a tokio runtime.
    pub fn submit(
        &self,
        episode_id: &str,
        segments: Vec<SegmentInput>,
    ) -> Result<JobHandle, ValidationError> {
        let job_id = job_id_for(episode_id);
        let admission = self.inner.store.admit(&job_id, || {
            validate_request(episode_id, &segments)?;
            Ok(Job::queued(episode_id, segments))
        })?;
        match admission {
            Admission::Existing(handle) => {
                info!(job_id = %handle.job_id, status = %handle.status, "duplicate submit joined running job");
                Ok(handle)
            }
            Admission::Created { entry, job } => {
                info!(job_id = %job.id, episode_id = %job.episode_id, segments = job.segments.len(), "job queued");
                let handle = JobHandle {
                    job_id: job.id.clone(),
                    status: job.status,
                    deduplicated: false,
                };
                tokio::spawn(self.inner.clone().drive(entry, job));
                Ok(handle)
            }
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.store.snapshot(job_id)
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.inner.store.snapshots()
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let outcome = self.inner.store.cancel(job_id);
        info!(job_id, outcome = ?outcome, "cancel requested");
        outcome
    }

    /// Resolves once the job reaches Completed or Failed.
    pub async fn wait(&self, job_id: &str) -> Option<JobSnapshot> {
        let entry = self.inner.store.get(job_id)?;
        let mut receiver = entry.subscribe();
        let terminal = match receiver.wait_for(|job| job.status.terminal()).await {
            Ok(job) => job.clone(),
            Err(_) => entry.current(),
        };
        Some(terminal.snapshot())
    }
}

impl ManagerInner {
    async fn drive(self: Arc<Self>, entry: Arc<JobEntry>, mut job: Job) {
        self.record(None, &job).await;
        let workspace = JobWorkspace::new(&self.settings.work_dir, &job.id);
        let outcome = self.run_stages(&entry, &mut job, &workspace).await;
        // Released before the terminal snapshot so a resubmission never
        // shares the directory with this run.
        workspace.release().await;
        match outcome {
            Ok(reference) => {
                job.result_ref = Some(reference);
                self.advance(&entry, &mut job, JobStatus::Completed).await;
            }
            Err(err) => self.fail(&entry, &mut job, err).await,
        }
    }

    async fn run_stages(
        &self,
        entry: &JobEntry,
        job: &mut Job,
        workspace: &JobWorkspace,
    ) -> Result<String, PipelineError> {
        let token = entry.token().clone();
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        workspace
            .prepare()
            .await
            .map_err(|source| PipelineError::Workspace {
                path: workspace.root.clone(),
                source,
            })?;

        self.advance(entry, job, JobStatus::Fetching).await;
        tokio::select! {
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            result = self.fetch_and_probe(entry, job, workspace) => result?,
        }
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.advance(entry, job, JobStatus::BuildingTimeline).await;
        let timeline = TimelineBuilder::build(job.segments.iter().map(|segment| MeasuredSegment {
            index: segment.index,
            duration_millis: segment.measured_duration_millis,
            text: &segment.text,
        }))?;
        job.timeline = Some(timeline.clone());

        let from = job.status;
        job.transition(JobStatus::Assembling);
        if !self.store.publish_unless_cancelled(entry, job) {
            job.status = from;
            return Err(PipelineError::Cancelled);
        }
        self.announce(from, job).await;

        let paths: Vec<PathBuf> = job
            .segments
            .iter()
            .filter_map(|segment| segment.local_path.clone())
            .collect();
        let output = self
            .pipeline
            .assembler
            .assemble(workspace, &paths, &timeline)
            .await?;
        if token.is_cancelled() {
            info!(job_id = %job.id, "cancel requested during assembly; skipping upload");
            return Err(PipelineError::Cancelled);
        }

        self.advance(entry, job, JobStatus::Uploading).await;
        let key = artifact_key(&job.episode_id, &job.id);
        let reference = self.pipeline.uploader.upload(&output, &key).await?;
        if token.is_cancelled() {
            warn!(job_id = %job.id, "cancel requested during upload arrived too late; artifact already published");
        }
        Ok(reference)
    }

    /// Fetches and probes segments with at most `max_concurrent_segments`
    /// in flight. A segment keeps its slot until its probe finishes.
    async fn fetch_and_probe(
        &self,
        entry: &JobEntry,
        job: &mut Job,
        workspace: &JobWorkspace,
    ) -> Result<(), PipelineError> {
        let limit = self.settings.max_concurrent_segments.max(1);
        let mut queue: VecDeque<(usize, String)> = job
            .segments
            .iter()
            .map(|segment| (segment.index, segment.source_url.clone()))
            .collect();
        let mut fetches_remaining = queue.len();
        let mut in_flight: FuturesUnordered<Step<'_>> = FuturesUnordered::new();

        while in_flight.len() < limit {
            let Some((index, url)) = queue.pop_front() else {
                break;
            };
            job.segments[index].status = SegmentStatus::Fetching;
            in_flight.push(self.fetch_step(workspace, index, url));
        }
        entry.publish(job);

        while let Some(step) = in_flight.next().await {
            match step? {
                StepOutcome::Fetched { index, path } => {
                    let segment = &mut job.segments[index];
                    segment.local_path = Some(path.clone());
                    segment.status = SegmentStatus::Probing;
                    in_flight.push(self.probe_step(index, path));
                    fetches_remaining -= 1;
                    if fetches_remaining == 0 {
                        self.advance(entry, job, JobStatus::Probing).await;
                    } else {
                        entry.publish(job);
                    }
                }
                StepOutcome::Probed {
                    index,
                    duration_millis,
                } => {
                    let segment = &mut job.segments[index];
                    segment.measured_duration_millis = Some(duration_millis);
                    segment.status = SegmentStatus::Ready;
                    if let Some((next, url)) = queue.pop_front() {
                        job.segments[next].status = SegmentStatus::Fetching;
                        in_flight.push(self.fetch_step(workspace, next, url));
                    }
                    entry.publish(job);
                }
            }
        }
        Ok(())
    }

    fn fetch_step<'a>(&'a self, workspace: &'a JobWorkspace, index: usize, url: String) -> Step<'a> {
        async move {
            let path = self.pipeline.fetcher.fetch(workspace, index, &url).await?;
            Ok(StepOutcome::Fetched { index, path })
        }
        .boxed()
    }

    fn probe_step(&self, index: usize, path: PathBuf) -> Step<'_> {
        async move {
            let duration_millis = self
                .pipeline
                .prober
                .probe(&path)
                .await
                .map_err(|source| PipelineError::Probe {
                    segment_index: index,
                    source,
                })?;
            Ok(StepOutcome::Probed {
                index,
                duration_millis,
            })
        }
        .boxed()
    }

    /// Journals the transition before publishing it, so any status a
    /// caller observes is already in the journal.
    async fn advance(&self, entry: &JobEntry, job: &mut Job, next: JobStatus) {
        let from = job.status;
        if !job.transition(next) {
            warn!(job_id = %job.id, from = %from, to = %next, "ignored invalid transition");
            return;
        }
        self.announce(from, job).await;
        entry.publish(job);
    }

    async fn fail(&self, entry: &JobEntry, job: &mut Job, err: PipelineError) {
        let from = job.status;
        let failure = JobFailure {
            kind: err.kind(),
            stage: from,
            message: err.to_string(),
            segment_index: err.segment_index(),
            exit_code: err.exit_code(),
        };
        if !job.fail(failure) {
            return;
        }
        warn!(job_id = %job.id, stage = %from, kind = %err.kind(), segment = ?err.segment_index(), error = %err, "job failed");
        self.record(Some(from), job).await;
        entry.publish(job);
    }

    async fn announce(&self, from: JobStatus, job: &Job) {
        info!(job_id = %job.id, from = %from, to = %job.status, "job transition");
        self.record(Some(from), job).await;
    }

    async fn record(&self, from: Option<JobStatus>, job: &Job) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.record(from, job).await {
            warn!(job_id = %job.id, error = %err, "failed to journal job transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(index: i64) -> SegmentInput {
        SegmentInput::new(index, format!("https://cdn.example/{index}.mp4"), "line")
    }

    #[test]
    fn artifact_keys_stay_inside_one_episode_directory() {
        let key = artifact_key("ep-100", "job_abc");
        assert!(key.starts_with("ep-100/job_abc-"));
        assert!(key.ends_with(".mp4"));

        for hostile in ["../escaped", "/etc/passwd", "a/b", "ep?x#y", ".."] {
            let key = artifact_key(hostile, "job_abc");
            let (episode, file) = key.split_once('/').unwrap();
            assert!(!file.contains('/'), "{key}");
            assert!(episode.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'), "{key}");
        }
        assert_eq!(artifact_key("../escaped", "job_abc").split('/').next(), Some("___escaped"));
    }

    #[test]
    fn validation_grid() {
        assert_eq!(validate_request("ep", &[input(0), input(1)]), Ok(()));
        assert_eq!(
            validate_request("ep", &[input(1), input(0), input(2)]),
            Ok(())
        );
        assert_eq!(
            validate_request("", &[input(0)]),
            Err(ValidationError::EmptyEpisodeId)
        );
        assert_eq!(validate_request("ep", &[]), Err(ValidationError::NoSegments));
        assert_eq!(
            validate_request("ep", &[input(0), input(2)]),
            Err(ValidationError::MissingIndex(1))
        );
        assert_eq!(
            validate_request("ep", &[input(0), input(0)]),
            Err(ValidationError::DuplicateIndex(0))
        );
        assert_eq!(
            validate_request("ep", &[input(-1), input(0)]),
            Err(ValidationError::NegativeIndex(-1))
        );
        assert_eq!(
            validate_request("ep", &[input(1), input(2)]),
            Err(ValidationError::MissingIndex(0))
        );
    }

    #[test]
    fn validation_rejects_unusable_urls() {
        for url in ["not a url", "ftp://cdn.example/a.mp4", "/relative/a.mp4"] {
            let err = validate_request("ep", &[SegmentInput::new(0, url, "x")]).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidSourceUrl { index: 0, .. }),
                "{url} should be rejected, got {err:?}"
            );
        }
        assert_eq!(
            validate_request("ep", &[SegmentInput::new(0, "file:///tmp/a.mp4", "x")]),
            Ok(())
        );
    }
}
