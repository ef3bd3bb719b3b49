use std::path::PathBuf;

use thiserror::Error;

use super::models::FailureKind;
use crate::assembler::AssemblyError;
use crate::fetcher::FetchError;
use crate::prober::ProbeError;
use crate::timeline::TimelineError;
use crate::uploader::UploadError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("episode id must not be empty")]
    EmptyEpisodeId,
    #[error("segment list must not be empty")]
    NoSegments,
    #[error("segment index {0} is negative")]
    NegativeIndex(i64),
    #[error("segment index {0} appears more than once")]
    DuplicateIndex(i64),
    #[error("segment indices have a gap: missing {0}")]
    MissingIndex(usize),
    #[error("segment {index} has an invalid source url {url:?}: {reason}")]
    InvalidSourceUrl {
        index: i64,
        url: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal path not configured")]
    MissingStore,
    #[error("failed to open journal database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal writer stopped")]
    WriterClosed,
}

pub type JournalResult<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] crate::error::ConfigError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] crate::uploader::StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Any stage failure of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("segment {segment_index}: {source}")]
    Probe {
        segment_index: usize,
        #[source]
        source: ProbeError,
    },
    #[error(transparent)]
    Timeline(#[from] TimelineError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Fetch(_) | PipelineError::Workspace { .. } => FailureKind::Fetch,
            PipelineError::Probe { .. } => FailureKind::Probe,
            PipelineError::Timeline(_) => FailureKind::Timeline,
            PipelineError::Assembly(_) => FailureKind::Assembly,
            PipelineError::Upload(_) => FailureKind::Upload,
            PipelineError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn segment_index(&self) -> Option<usize> {
        match self {
            PipelineError::Fetch(err) => Some(err.segment_index),
            PipelineError::Probe { segment_index, .. } => Some(*segment_index),
            PipelineError::Timeline(err) => err.segment_index(),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::Assembly(err) => err.exit_code(),
            _ => None,
        }
    }
}
