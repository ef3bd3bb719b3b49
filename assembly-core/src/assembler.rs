use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::command::{describe, stderr_tail, CommandExecutor};
use crate::config::{AssemblySection, ToolsSection};
use crate::prober::{MediaProber, ProbeError};
use crate::retry::{RetryPolicy, Transient};
use crate::timeline::Timeline;
use crate::workspace::JobWorkspace;

pub const SUBTITLE_FILE_NAME: &str = "subtitles.srt";
pub const CONCAT_LIST_NAME: &str = "concat.txt";
pub const OUTPUT_FILE_NAME: &str = "episode.mp4";

const EXHAUSTION_MARKERS: [&str; 4] = [
    "cannot allocate memory",
    "out of memory",
    "no space left on device",
    "resource temporarily unavailable",
];

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no segments to assemble")]
    NoSegments,
    #[error("{paths} segment files do not match {entries} timeline entries")]
    SegmentMismatch { paths: usize, entries: usize },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("ffmpeg exited with {status}: {stderr}")]
    ToolFailed {
        status: ExitStatus,
        exit_code: Option<i32>,
        stderr: String,
        resource_exhausted: bool,
    },
    #[error("ffmpeg reported success but {0} is missing or empty")]
    MissingOutput(PathBuf),
    #[error("assembled runtime {actual_millis}ms is off the timeline total {expected_millis}ms by more than {tolerance_millis}ms")]
    DurationMismatch {
        expected_millis: u64,
        actual_millis: u64,
        tolerance_millis: u64,
    },
    #[error("failed to probe assembled output: {0}")]
    Probe(#[source] ProbeError),
}

impl AssemblyError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AssemblyError::ToolFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

impl Transient for AssemblyError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AssemblyError::ToolFailed {
                resource_exhausted: true,
                ..
            }
        )
    }
}

const SIGKILL: i32 = 9;

#[cfg(unix)]
fn killed_by_sigkill(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(SIGKILL)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &ExitStatus) -> bool {
    false
}

/// OOM kills arrive as SIGKILL, or as exit 137 when a shell reports them.
fn is_resource_exhaustion(status: &ExitStatus, stderr: &str) -> bool {
    if killed_by_sigkill(status) || status.code() == Some(128 + SIGKILL) {
        return true;
    }
    let stderr = stderr.to_ascii_lowercase();
    EXHAUSTION_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Escapes a path for use as a filter option value inside a filtergraph.
pub fn escape_filter_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut option_level = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ':' | '\'') {
            option_level.push('\\');
        }
        option_level.push(c);
    }
    let mut graph_level = String::with_capacity(option_level.len());
    for c in option_level.chars() {
        if matches!(c, '\\' | '\'' | '[' | ']' | ',' | ';') {
            graph_level.push('\\');
        }
        graph_level.push(c);
    }
    graph_level
}

/// Builds the concat demuxer list, one `file` directive per segment.
pub fn concat_list(paths: &[PathBuf]) -> String {
    let mut list = String::from("ffconcat version 1.0\n");
    for path in paths {
        let escaped = path.to_string_lossy().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}

/// Burns subtitles into the concatenation of the segment files.
#[derive(Clone)]
pub struct Assembler {
    ffmpeg: PathBuf,
    log_level: String,
    video_codec: String,
    audio_codec: String,
    tolerance_millis: u64,
    executor: Arc<dyn CommandExecutor>,
    prober: Option<MediaProber>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("ffmpeg", &self.ffmpeg)
            .field("video_codec", &self.video_codec)
            .field("audio_codec", &self.audio_codec)
            .field("tolerance_millis", &self.tolerance_millis)
            .finish()
    }
}

impl Assembler {
    pub fn new(
        tools: &ToolsSection,
        assembly: &AssemblySection,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            ffmpeg: tools.ffmpeg.clone(),
            log_level: tools.log_level.clone(),
            video_codec: assembly.video_codec.clone(),
            audio_codec: assembly.audio_codec.clone(),
            tolerance_millis: assembly.frame_interval_millis(),
            executor,
            prober: None,
            // One retry, reserved for resource exhaustion.
            retry_policy: RetryPolicy::new(2, Duration::from_secs(2), Duration::from_secs(2)),
        }
    }

    /// Verifies the assembled runtime against the timeline with `prober`.
    pub fn with_prober(mut self, prober: MediaProber) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub async fn assemble(
        &self,
        workspace: &JobWorkspace,
        segments: &[PathBuf],
        timeline: &Timeline,
    ) -> Result<PathBuf, AssemblyError> {
        if segments.is_empty() {
            return Err(AssemblyError::NoSegments);
        }
        if segments.len() != timeline.entries.len() {
            return Err(AssemblyError::SegmentMismatch {
                paths: segments.len(),
                entries: timeline.entries.len(),
            });
        }

        let subtitles = workspace.assembly.join(SUBTITLE_FILE_NAME);
        write_file(&subtitles, timeline.to_srt()).await?;
        let list = workspace.assembly.join(CONCAT_LIST_NAME);
        write_file(&list, concat_list(segments)).await?;
        let output = workspace.assembly.join(OUTPUT_FILE_NAME);

        let args = self.ffmpeg_args(&list, &subtitles, &output);
        self.retry_policy
            .run("assemble", |attempt| {
                let args = &args;
                let output = &output;
                async move {
                    if attempt > 0 {
                        let _ = fs::remove_file(output).await;
                    }
                    self.run_ffmpeg(args, output).await
                }
            })
            .await?;

        if let Some(prober) = &self.prober {
            let actual = prober.probe(&output).await.map_err(AssemblyError::Probe)?;
            let expected = timeline.total_duration_millis;
            if actual.abs_diff(expected) > self.tolerance_millis {
                return Err(AssemblyError::DurationMismatch {
                    expected_millis: expected,
                    actual_millis: actual,
                    tolerance_millis: self.tolerance_millis,
                });
            }
        }
        info!(output = %output.display(), segments = segments.len(), total_ms = timeline.total_duration_millis, "episode assembled");
        Ok(output)
    }

    fn ffmpeg_args(&self, list: &Path, subtitles: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("subtitles=filename={}", escape_filter_path(subtitles)),
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn run_ffmpeg(&self, args: &[String], output: &Path) -> Result<(), AssemblyError> {
        let result = self
            .executor
            .run(&self.ffmpeg, args)
            .await
            .map_err(|source| AssemblyError::Spawn {
                command: describe(&self.ffmpeg, args),
                source,
            })?;
        if !result.status.success() {
            let stderr = stderr_tail(&result);
            let exit_code = result.status.code();
            let resource_exhausted = is_resource_exhaustion(&result.status, &stderr);
            if resource_exhausted {
                warn!(status = %result.status, "ffmpeg ran out of resources");
            }
            return Err(AssemblyError::ToolFailed {
                status: result.status,
                exit_code,
                stderr,
                resource_exhausted,
            });
        }
        match fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(AssemblyError::MissingOutput(output.to_path_buf())),
        }
    }
}

async fn write_file(path: &Path, contents: String) -> Result<(), AssemblyError> {
    fs::write(path, contents)
        .await
        .map_err(|source| AssemblyError::Io {
            path: path.to_path_buf(),
            source,
        })
}
