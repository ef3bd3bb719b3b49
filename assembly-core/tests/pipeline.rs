#![cfg(unix)]

use std::collections::{HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use assembly_core::config::{AssemblySection, ToolsSection};
use assembly_core::job::{
    CancelOutcome, FailureKind, HealthPayload, JobManager, JobStatus, ManagerSettings, Pipeline,
};
use assembly_core::{
    parse_srt, Assembler, CommandExecutor, LocalArtifactStore, MediaProber, RetryPolicy,
    SegmentFetcher, SegmentInput, SqliteJobJournal, Uploader,
};

fn mp4_bytes() -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
    bytes.extend_from_slice(b"ftypisom");
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

fn output(code: i32, stdout: &str, stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Stands in for ffprobe and ffmpeg. Probe results are keyed by file name.
#[derive(Default)]
struct ScriptedExecutor {
    durations: HashMap<String, String>,
    ffmpeg_failures: Mutex<VecDeque<(ExitStatus, String)>>,
    gate: Option<Arc<Notify>>,
    entered: Arc<Notify>,
    ffmpeg_calls: AtomicUsize,
    captured_srt: Mutex<Option<String>>,
    captured_list: Mutex<Option<String>>,
}

impl ScriptedExecutor {
    fn with_durations(pairs: &[(&str, &str)]) -> Self {
        Self {
            durations: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn fail_ffmpeg(self, code: i32, stderr: &str) -> Self {
        self.ffmpeg_failures
            .lock()
            .unwrap()
            .push_back((ExitStatus::from_raw(code << 8), stderr.to_string()));
        self
    }

    /// ffmpeg terminated by `signal`, with nothing on stderr.
    fn kill_ffmpeg(self, signal: i32) -> Self {
        self.ffmpeg_failures
            .lock()
            .unwrap()
            .push_back((ExitStatus::from_raw(signal), String::new()));
        self
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        let target = PathBuf::from(args.last().cloned().unwrap_or_default());
        if program == Path::new("ffprobe") {
            let name = target
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(match self.durations.get(&name) {
                Some(value) => output(0, &format!("{value}\n"), ""),
                None => output(1, "", &format!("{name}: No such file or directory")),
            });
        }

        self.ffmpeg_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let list = args
            .iter()
            .position(|arg| arg == "-i")
            .map(|position| PathBuf::from(&args[position + 1]))
            .expect("ffmpeg called without an input list");
        let assembly_dir = list.parent().unwrap().to_path_buf();
        *self.captured_list.lock().unwrap() = std::fs::read_to_string(&list).ok();
        *self.captured_srt.lock().unwrap() =
            std::fs::read_to_string(assembly_dir.join("subtitles.srt")).ok();

        let failure = self.ffmpeg_failures.lock().unwrap().pop_front();
        if let Some((status, stderr)) = failure {
            return Ok(Output {
                status,
                stdout: Vec::new(),
                stderr: stderr.into_bytes(),
            });
        }
        std::fs::write(&target, b"assembled episode")?;
        Ok(output(0, "", ""))
    }
}

struct Harness {
    dir: TempDir,
    manager: JobManager,
    executor: Arc<ScriptedExecutor>,
    journal: SqliteJobJournal,
}

impl Harness {
    fn new(executor: ScriptedExecutor) -> Self {
        Self::with_concurrency(executor, 4)
    }

    fn with_concurrency(executor: ScriptedExecutor, max_concurrent_segments: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(executor);
        let tools = ToolsSection {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            probe_timeout_seconds: 5,
            log_level: "error".into(),
        };
        let assembly = AssemblySection {
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            frame_rate: 30.0,
        };
        let prober = MediaProber::new("ffprobe", Duration::from_secs(5), executor.clone());
        let assembler = Assembler::new(&tools, &assembly, executor.clone())
            .with_prober(prober.clone())
            .with_retry_policy(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO));
        let pipeline = Pipeline {
            fetcher: SegmentFetcher::new(
                Client::new(),
                RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20)),
            ),
            prober,
            assembler,
            uploader: Uploader::new(
                Arc::new(LocalArtifactStore::new(dir.path().join("published"))),
                RetryPolicy::single_attempt(),
            ),
        };
        let journal = SqliteJobJournal::new(dir.path().join("data/jobs.sqlite")).unwrap();
        journal.initialize().unwrap();
        let manager = JobManager::new(
            ManagerSettings {
                service_name: "WanVideoAssembler".into(),
                work_dir: dir.path().join("work"),
                max_concurrent_segments,
            },
            pipeline,
            Some(journal.clone()),
        );
        Self {
            dir,
            manager,
            executor,
            journal,
        }
    }

    fn workspace(&self, job_id: &str) -> PathBuf {
        self.dir.path().join("work").join(job_id)
    }

    fn published(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(episodes) = std::fs::read_dir(self.dir.path().join("published")) else {
            return files;
        };
        for episode in episodes.flatten() {
            for file in std::fs::read_dir(episode.path()).unwrap().flatten() {
                files.push(file.path());
            }
        }
        files
    }

    async fn settle(&self, job_id: &str) -> assembly_core::JobSnapshot {
        timeout(Duration::from_secs(10), self.manager.wait(job_id))
            .await
            .expect("job did not finish in time")
            .expect("job exists")
    }

    async fn reach(&self, job_id: &str, status: JobStatus) {
        timeout(Duration::from_secs(5), async {
            loop {
                if self.manager.status(job_id).map(|s| s.status) == Some(status) {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status not reached");
    }
}

async fn serve_segment(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(mp4_bytes()))
        .mount(server)
        .await;
}

fn two_segments(server: &MockServer) -> Vec<SegmentInput> {
    vec![
        SegmentInput::new(1, format!("{}/seg1.mp4", server.uri()), "World"),
        SegmentInput::new(0, format!("{}/seg0.mp4", server.uri()), "Hello"),
    ]
}

fn standard_durations() -> ScriptedExecutor {
    ScriptedExecutor::with_durations(&[
        ("segment_0000.mp4", "5.200000"),
        ("segment_0001.mp4", "3.800000"),
        ("episode.mp4", "9.010000"),
    ])
}

#[tokio::test]
async fn assembles_and_publishes_episode() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations());

    let handle = harness.manager.submit("ep-100", two_segments(&server)).unwrap();
    assert!(!handle.deduplicated);
    let snapshot = harness.settle(&handle.job_id).await;

    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.total_duration_millis, Some(9_000));
    let durations: Vec<Option<u64>> = snapshot.segments.iter().map(|s| s.duration_millis).collect();
    assert_eq!(durations, vec![Some(5_200), Some(3_800)]);
    let reference = snapshot.result_ref.expect("result reference");
    assert!(reference.starts_with("file://"));
    assert!(reference.contains("/ep-100/"));

    let srt = harness.executor.captured_srt.lock().unwrap().clone().unwrap();
    assert_eq!(
        srt,
        "1\n00:00:00,000 --> 00:00:05,200\nHello\n\n2\n00:00:05,200 --> 00:00:09,000\nWorld\n\n"
    );
    let cues = parse_srt(&srt).unwrap();
    assert_eq!(cues[1].start_millis, cues[0].end_millis);

    let list = harness.executor.captured_list.lock().unwrap().clone().unwrap();
    let first = list.find("segment_0000.mp4").unwrap();
    let second = list.find("segment_0001.mp4").unwrap();
    assert!(first < second);

    let published = harness.published();
    assert_eq!(published.len(), 1);
    assert_eq!(std::fs::read(&published[0]).unwrap(), b"assembled episode");
    assert!(!harness.workspace(&handle.job_id).exists());

    let history: Vec<String> = harness
        .journal
        .history(&handle.job_id)
        .unwrap()
        .into_iter()
        .map(|record| record.to_status)
        .collect();
    assert_eq!(
        history,
        vec![
            "queued",
            "fetching",
            "probing",
            "building_timeline",
            "assembling",
            "uploading",
            "completed"
        ]
    );
    assert_eq!(harness.manager.cancel(&handle.job_id), CancelOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn single_slot_still_assembles_in_index_order() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::with_concurrency(standard_durations(), 1);

    let handle = harness.manager.submit("ep-serial", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(snapshot.total_duration_millis, Some(9_000));
}

#[tokio::test]
async fn missing_segment_fails_the_job_without_assembly() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    Mock::given(method("GET"))
        .and(path("/seg1.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let harness = Harness::new(standard_durations());

    let handle = harness.manager.submit("ep-404", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Fetch);
    assert_eq!(error.segment_index, Some(1));
    assert!(error.message.contains("404"), "{}", error.message);
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 0);
    assert!(harness.published().is_empty());
    assert!(!harness.workspace(&handle.job_id).exists());
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/seg0.mp4"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations());

    let handle = harness.manager.submit("ep-flaky", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
}

#[tokio::test]
async fn unprobeable_segment_reports_its_index() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(ScriptedExecutor::with_durations(&[
        ("segment_0000.mp4", "5.200000"),
        ("segment_0001.mp4", "N/A"),
    ]));

    let handle = harness.manager.submit("ep-probe", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Probe);
    assert_eq!(error.segment_index, Some(1));
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn assembler_failure_is_not_uploaded() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(
        standard_durations().fail_ffmpeg(1, "concat.txt: Invalid data found when processing input"),
    );

    let handle = harness.manager.submit("ep-broken", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Assembly);
    assert_eq!(error.stage, JobStatus::Assembling);
    assert_eq!(error.exit_code, Some(1));
    assert!(error.message.contains("Invalid data found"));
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 1);
    assert!(harness.published().is_empty());
    assert!(snapshot.result_ref.is_none());
    assert!(!harness.workspace(&handle.job_id).exists());
}

#[tokio::test]
async fn resource_exhaustion_is_retried_once() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations().fail_ffmpeg(137, "Killed"));

    let handle = harness.manager.submit("ep-oom", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ffmpeg_killed_by_sigkill_is_retried_once() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations().kill_ffmpeg(9));

    let handle = harness.manager.submit("ep-oom-killed", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ffmpeg_stopped_by_sigterm_is_not_retried() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations().kill_ffmpeg(15));

    let handle = harness.manager.submit("ep-terminated", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Assembly);
    assert_eq!(error.exit_code, None);
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duration_drift_fails_assembly() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(ScriptedExecutor::with_durations(&[
        ("segment_0000.mp4", "5.200000"),
        ("segment_0001.mp4", "3.800000"),
        ("episode.mp4", "8.500000"),
    ]));

    let handle = harness.manager.submit("ep-drift", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Assembly);
    assert!(harness.published().is_empty());
}

#[tokio::test]
async fn duplicate_submit_joins_running_job() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(mp4_bytes())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let harness = Harness::new(standard_durations());

    let first = harness.manager.submit("ep-dup", two_segments(&server)).unwrap();
    let second = harness.manager.submit("ep-dup", two_segments(&server)).unwrap();
    assert_eq!(first.job_id, second.job_id);
    assert!(second.deduplicated);
    assert_eq!(harness.manager.list().len(), 1);

    harness.reach(&first.job_id, JobStatus::Fetching).await;
    assert_eq!(harness.manager.cancel(&first.job_id), CancelOutcome::Cancelled);
    harness.settle(&first.job_id).await;
}

#[tokio::test]
async fn cancel_during_fetching_aborts_downloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(mp4_bytes())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let harness = Harness::new(standard_durations());

    let handle = harness.manager.submit("ep-cancel", two_segments(&server)).unwrap();
    harness.reach(&handle.job_id, JobStatus::Fetching).await;
    assert_eq!(harness.manager.cancel(&handle.job_id), CancelOutcome::Cancelled);

    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Cancelled);
    assert_eq!(error.stage, JobStatus::Fetching);
    assert_eq!(harness.executor.ffmpeg_calls.load(Ordering::SeqCst), 0);
    assert!(!harness.workspace(&handle.job_id).exists());
    assert_eq!(harness.manager.cancel("job_0000000000000000"), CancelOutcome::NotFound);

    let history: Vec<String> = harness
        .journal
        .history(&handle.job_id)
        .unwrap()
        .into_iter()
        .map(|record| record.to_status)
        .collect();
    assert_eq!(history, vec!["queued", "fetching", "failed"]);
}

#[tokio::test]
async fn cancel_during_assembly_is_deferred_until_upload() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let gate = Arc::new(Notify::new());
    let harness = Harness::new(standard_durations().gated(gate.clone()));

    let handle = harness.manager.submit("ep-late", two_segments(&server)).unwrap();
    timeout(Duration::from_secs(5), harness.executor.entered.notified())
        .await
        .expect("assembly never started");
    assert_eq!(
        harness.manager.status(&handle.job_id).unwrap().status,
        JobStatus::Assembling
    );
    assert_eq!(harness.manager.cancel(&handle.job_id), CancelOutcome::Deferred);
    gate.notify_one();

    let snapshot = harness.settle(&handle.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.expect("failure details");
    assert_eq!(error.kind, FailureKind::Cancelled);
    assert_eq!(error.stage, JobStatus::Assembling);
    assert!(harness.published().is_empty());
    assert!(!harness.workspace(&handle.job_id).exists());
}

#[tokio::test]
async fn invalid_requests_create_no_job() {
    let harness = Harness::new(standard_durations());
    let gap = vec![
        SegmentInput::new(0, "https://cdn.example/0.mp4", "a"),
        SegmentInput::new(2, "https://cdn.example/2.mp4", "c"),
    ];
    assert!(harness.manager.submit("ep-gap", gap).is_err());
    assert!(harness.manager.submit("ep-empty", Vec::new()).is_err());
    assert!(harness
        .manager
        .submit("", vec![SegmentInput::new(0, "https://cdn.example/0.mp4", "a")])
        .is_err());
    assert!(harness.manager.list().is_empty());
    assert_eq!(harness.manager.health(), HealthPayload::ok("WanVideoAssembler"));
}

#[tokio::test]
async fn episode_ids_cannot_steer_the_published_path() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations());

    let handle = harness.manager.submit("../escaped", two_segments(&server)).unwrap();
    let snapshot = harness.settle(&handle.job_id).await;

    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
    let reference = snapshot.result_ref.expect("result reference");
    assert!(reference.contains("/published/___escaped/"), "{reference}");
    assert!(!reference.contains(".."), "{reference}");
    assert!(!harness.dir.path().join("escaped").exists());
    assert_eq!(harness.published().len(), 1);
}

#[tokio::test]
async fn resubmitting_a_finished_episode_starts_a_new_run() {
    let server = MockServer::start().await;
    serve_segment(&server, "/seg0.mp4").await;
    serve_segment(&server, "/seg1.mp4").await;
    let harness = Harness::new(standard_durations());

    let first = harness.manager.submit("ep-again", two_segments(&server)).unwrap();
    harness.settle(&first.job_id).await;
    let second = harness.manager.submit("ep-again", two_segments(&server)).unwrap();
    assert_eq!(first.job_id, second.job_id);
    assert!(!second.deduplicated);
    let snapshot = harness.settle(&second.job_id).await;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(harness.published().len(), 2);
}
