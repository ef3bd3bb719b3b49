use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AssemblerConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub fetch: FetchSection,
    pub tools: ToolsSection,
    pub assembly: AssemblySection,
    pub store: StoreSection,
}

impl AssemblerConfig {
    /// Checks the values serde cannot express as types.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_segments == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_concurrent_segments",
                reason: "must be greater than zero".into(),
            });
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if self.store.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "store.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if !(self.assembly.frame_rate > 0.0) {
            return Err(ConfigError::Invalid {
                field: "assembly.frame_rate",
                reason: format!("{} is not a positive frame rate", self.assembly.frame_rate),
            });
        }
        match self.store.kind {
            StoreKind::Http if self.store.endpoint.is_none() => Err(ConfigError::Invalid {
                field: "store.endpoint",
                reason: "required when store.kind = \"http\"".into(),
            }),
            StoreKind::Local if self.store.local_dir.is_none() => Err(ConfigError::Invalid {
                field: "store.local_dir",
                reason: "required when store.kind = \"local\"".into(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub work_dir: PathBuf,
    pub journal_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_segments: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    pub user_agent: String,
}

impl FetchSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
        .with_jitter(Duration::from_millis(self.jitter_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub probe_timeout_seconds: u64,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssemblySection {
    pub video_codec: String,
    pub audio_codec: String,
    pub frame_rate: f64,
}

impl AssemblySection {
    /// Tolerated drift between the assembled output and the timeline total.
    pub fn frame_interval_millis(&self) -> u64 {
        (1000.0 / self.frame_rate).ceil() as u64
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Http,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub kind: StoreKind,
    pub endpoint: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub token_path: Option<PathBuf>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl StoreSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

pub fn load_assembler_config<P: AsRef<Path>>(path: P) -> Result<AssemblerConfig> {
    let config: AssemblerConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
