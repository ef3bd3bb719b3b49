use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::command::{describe, stderr_tail, CommandExecutor};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("probe of {path} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("probe of {path} exited with status {status:?}: {stderr}")]
    NonZeroExit {
        path: PathBuf,
        status: Option<i32>,
        stderr: String,
    },
    #[error("unparseable duration {output:?} for {path}")]
    Unparseable { path: PathBuf, output: String },
    #[error("non-positive duration {output:?} for {path}")]
    NonPositive { path: PathBuf, output: String },
}

/// Measures media durations with ffprobe.
#[derive(Clone)]
pub struct MediaProber {
    ffprobe: PathBuf,
    timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for MediaProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaProber")
            .field("ffprobe", &self.ffprobe)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MediaProber {
    pub fn new(ffprobe: impl Into<PathBuf>, timeout: Duration, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout,
            executor,
        }
    }

    pub async fn probe(&self, path: &Path) -> Result<u64, ProbeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = match timeout(self.timeout, self.executor.run(&self.ffprobe, &args)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    command: describe(&self.ffprobe, &args),
                    source,
                })
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    path: path.to_path_buf(),
                    timeout: self.timeout,
                })
            }
        };
        if !output.status.success() {
            return Err(ProbeError::NonZeroExit {
                path: path.to_path_buf(),
                status: output.status.code(),
                stderr: stderr_tail(&output),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = stdout.lines().map(str::trim).find(|line| !line.is_empty());
        let Some(value) = value else {
            return Err(ProbeError::Unparseable {
                path: path.to_path_buf(),
                output: stdout.to_string(),
            });
        };
        match parse_duration_millis(value) {
            Some(0) => Err(ProbeError::NonPositive {
                path: path.to_path_buf(),
                output: value.to_string(),
            }),
            Some(millis) => {
                debug!(file = %path.display(), millis, "probed media duration");
                Ok(millis)
            }
            None if value.starts_with('-') && parse_duration_millis(&value[1..]).is_some() => {
                Err(ProbeError::NonPositive {
                    path: path.to_path_buf(),
                    output: value.to_string(),
                })
            }
            None => Err(ProbeError::Unparseable {
                path: path.to_path_buf(),
                output: value.to_string(),
            }),
        }
    }
}

/// Parses a decimal seconds value (`"5.200000"`) to whole milliseconds,
/// truncating sub-millisecond digits so the result never exceeds the media.
pub fn parse_duration_millis(value: &str) -> Option<u64> {
    let value = value.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let seconds: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut millis = 0u64;
    for (position, digit) in fraction.chars().take(3).enumerate() {
        let digit = digit.to_digit(10)? as u64;
        millis += digit * 10u64.pow(2 - position as u32);
    }
    seconds.checked_mul(1_000)?.checked_add(millis)
}
