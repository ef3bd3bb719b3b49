use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Body, Client};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use url::Url;

use crate::config::{StoreKind, StoreSection};
use crate::retry::{RetryPolicy, Transient};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),
    #[error("artifact store rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("missing store credentials at {0}")]
    MissingToken(PathBuf),
    #[error("invalid artifact reference: {0}")]
    InvalidReference(String),
    #[error("artifact key {0:?} must be a relative path of plain segments")]
    InvalidKey(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload of {path} failed: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
    #[error("artifact {0} does not exist")]
    MissingArtifact(PathBuf),
}

/// Keys are `/`-separated relative paths; `.`, `..`, empty and rooted parts are refused.
fn check_key(key: &str) -> Result<(), StoreError> {
    let plain = !key.is_empty()
        && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
        && Path::new(key)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Durable home of finished episodes.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores the file under `key` and returns an externally resolvable reference.
    async fn put(&self, key: &str, path: &Path) -> Result<String, StoreError>;
}

/// Copies artifacts into a local directory and hands out `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, path: &Path) -> Result<String, StoreError> {
        check_key(key)?;
        let destination = self.root.join(key);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        fs::copy(path, &destination)
            .await
            .map_err(|source| StoreError::Io {
                path: destination.clone(),
                source,
            })?;
        let absolute = if destination.is_absolute() {
            destination
        } else {
            std::env::current_dir()
                .map_err(|source| StoreError::Io {
                    path: destination.clone(),
                    source,
                })?
                .join(destination)
        };
        Url::from_file_path(&absolute)
            .map(|url| url.to_string())
            .map_err(|_| StoreError::InvalidReference(absolute.display().to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    url: Option<String>,
}

/// Streams artifacts to an HTTP object endpoint with `PUT <endpoint>/<key>`.
#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: Client,
    endpoint: String,
    token_path: Option<PathBuf>,
}

impl HttpArtifactStore {
    pub fn new(client: Client, endpoint: impl Into<String>, token_path: Option<PathBuf>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token_path,
        }
    }

    async fn load_token(&self) -> Result<Option<String>, StoreError> {
        let Some(path) = &self.token_path else {
            return Ok(None);
        };
        let token = fs::read_to_string(path)
            .await
            .map_err(|_| StoreError::MissingToken(path.clone()))?;
        Ok(Some(token.trim().to_string()))
    }

    fn object_url(&self, key: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|err| StoreError::InvalidReference(format!("{}: {err}", self.endpoint)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidReference(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, key: &str, path: &Path) -> Result<String, StoreError> {
        check_key(key)?;
        let object_url = self.object_url(key)?;
        let file = fs::File::open(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let length = file
            .metadata()
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let mut request = self
            .client
            .put(object_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        if let Some(token) = self.load_token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(StoreError::Unavailable(format!("status {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let Some(location) = location {
            return Ok(location);
        }
        let body = response.text().await.unwrap_or_default();
        let reported = serde_json::from_str::<PutResponse>(&body)
            .ok()
            .and_then(|parsed| parsed.url);
        Ok(reported.unwrap_or_else(|| object_url.to_string()))
    }
}

pub fn store_from_config(
    section: &StoreSection,
    client: Client,
) -> Result<Arc<dyn ArtifactStore>, StoreError> {
    match section.kind {
        StoreKind::Local => {
            let root = section
                .local_dir
                .clone()
                .ok_or_else(|| StoreError::InvalidReference("store.local_dir not set".into()))?;
            Ok(Arc::new(LocalArtifactStore::new(root)))
        }
        StoreKind::Http => {
            let endpoint = section
                .endpoint
                .clone()
                .ok_or_else(|| StoreError::InvalidReference("store.endpoint not set".into()))?;
            Ok(Arc::new(HttpArtifactStore::new(
                client,
                endpoint,
                section.token_path.clone(),
            )))
        }
    }
}

/// Publishes assembled episodes and removes the local copy afterwards.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ArtifactStore>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl Uploader {
    pub fn new(store: Arc<dyn ArtifactStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    pub async fn upload(&self, path: &Path, key: &str) -> Result<String, UploadError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(UploadError::MissingArtifact(path.to_path_buf()));
        }
        let reference = self
            .retry_policy
            .run("upload", |_| self.store.put(key, path))
            .await
            .map_err(|source| UploadError::Store {
                path: path.to_path_buf(),
                source,
            })?;
        if let Err(err) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %err, "failed to remove uploaded artifact");
        }
        info!(key, reference = %reference, "artifact published");
        Ok(reference)
    }
}
