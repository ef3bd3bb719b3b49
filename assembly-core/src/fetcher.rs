use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

use crate::config::FetchSection;
use crate::retry::{RetryPolicy, Transient};
use crate::workspace::JobWorkspace;

const SNIFF_LEN: usize = 512;
const ISO_BMFF_BOXES: [&[u8]; 6] = [b"ftyp", b"moov", b"mdat", b"free", b"wide", b"skip"];

#[derive(Debug, Error)]
pub enum FetchCause {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("downloaded file is empty")]
    Empty,
    #[error("downloaded file is not a recognized media container")]
    UnrecognizedContainer,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Transient for FetchCause {
    fn is_transient(&self) -> bool {
        match self {
            FetchCause::Status(code) => *code >= 500,
            FetchCause::Timeout | FetchCause::Connection(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchCause {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchCause::Timeout
        } else if let Some(status) = error.status() {
            FetchCause::Status(status.as_u16())
        } else if error.is_connect() || error.is_request() || error.is_body() {
            FetchCause::Connection(error.to_string())
        } else {
            FetchCause::Network(error.to_string())
        }
    }
}

#[derive(Debug, Error)]
#[error("segment {segment_index} fetch failed: {cause}")]
pub struct FetchError {
    pub segment_index: usize,
    #[source]
    pub cause: FetchCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    IsoBmff,
    Matroska,
    MpegTs,
    MpegPs,
    Avi,
    Flv,
}

/// Identifies a media container from the first bytes of a file.
pub fn sniff_container(header: &[u8]) -> Option<ContainerKind> {
    if header.len() >= 8 {
        if ISO_BMFF_BOXES.contains(&&header[4..8]) {
            return Some(ContainerKind::IsoBmff);
        }
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(ContainerKind::Matroska);
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"AVI " {
        return Some(ContainerKind::Avi);
    }
    if header.starts_with(b"FLV") {
        return Some(ContainerKind::Flv);
    }
    if header.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        return Some(ContainerKind::MpegPs);
    }
    if header.first() == Some(&0x47) && (header.len() <= 188 || header[188] == 0x47) {
        return Some(ContainerKind::MpegTs);
    }
    None
}

fn extension_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mp4".to_string())
}

/// Downloads segment sources into a job workspace.
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    http_client: Client,
    retry_policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, retry_policy: RetryPolicy) -> Self {
        Self {
            http_client,
            retry_policy,
        }
    }

    pub fn from_config(section: &FetchSection) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .user_agent(section.user_agent.clone())
            .timeout(section.timeout())
            .build()?;
        Ok(Self::new(http_client, section.retry_policy()))
    }

    pub async fn fetch(
        &self,
        workspace: &JobWorkspace,
        segment_index: usize,
        source_url: &str,
    ) -> Result<PathBuf, FetchError> {
        let wrap = |cause: FetchCause| FetchError {
            segment_index,
            cause,
        };
        let url = Url::parse(source_url).map_err(|err| wrap(FetchCause::InvalidUrl(err.to_string())))?;
        let destination = workspace.segment_path(segment_index, &extension_for(&url));

        let result = self
            .retry_policy
            .run("fetch", |attempt| {
                let url = &url;
                let destination = &destination;
                async move {
                    debug!(segment = segment_index, attempt = attempt + 1, url = %url, "fetching segment");
                    self.download(url, destination).await?;
                    validate_media(destination).await
                }
            })
            .await;

        match result {
            Ok(size) => {
                debug!(segment = segment_index, bytes = size, path = %destination.display(), "segment fetched");
                Ok(destination)
            }
            Err(cause) => {
                if let Err(err) = fs::remove_file(&destination).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %destination.display(), error = %err, "failed to remove partial segment");
                    }
                }
                Err(wrap(cause))
            }
        }
    }

    async fn download(&self, url: &Url, destination: &Path) -> Result<(), FetchCause> {
        if url.scheme() == "file" {
            let source = url
                .to_file_path()
                .map_err(|_| FetchCause::InvalidUrl(format!("invalid file url {url}")))?;
            fs::copy(&source, destination)
                .await
                .map_err(|source_err| FetchCause::Io {
                    path: source,
                    source: source_err,
                })?;
            return Ok(());
        }
        let response = self.http_client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchCause::Status(status.as_u16()));
        }
        let mut stream = response.bytes_stream();
        let mut file = fs::File::create(destination)
            .await
            .map_err(|source| FetchCause::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        while let Some(chunk) = stream.next().await {
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| FetchCause::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
        }
        file.flush().await.map_err(|source| FetchCause::Io {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

async fn validate_media(path: &Path) -> Result<u64, FetchCause> {
    let io_err = |source: std::io::Error| FetchCause::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = fs::metadata(path).await.map_err(io_err)?.len();
    if size == 0 {
        return Err(FetchCause::Empty);
    }
    let mut file = fs::File::open(path).await.map_err(io_err)?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    (&mut file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(io_err)?;
    if sniff_container(&header).is_none() {
        return Err(FetchCause::UnrecognizedContainer);
    }
    Ok(size)
}
