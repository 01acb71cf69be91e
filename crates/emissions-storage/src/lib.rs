//! Destination table, raw response archive and HTTP utilities for emissions ingest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use emissions_core::PartitionKey;
pub use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

mod table;

pub use table::{item_details_schema, records_to_batch, AppendedPartition, ItemDetailsTable, TableError};

pub const CRATE_NAME: &str = "emissions-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
#[error("raw archive io on {}: {source}", .path.display())]
pub struct ArchiveError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl ArchiveError {
    fn at(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Immutable, hash-addressed copies of raw report responses.
///
/// Layout: `{root}/{YYYYMMDD_HHMMSS}/{month}_{scope}/{sha256}.json`.
#[derive(Debug, Clone)]
pub struct RawResponseArchive {
    root: PathBuf,
}

impl RawResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(fetched_at: DateTime<Utc>, key: &PartitionKey) -> PathBuf {
        Path::new(&fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(format!("{}_{}", key.month_str(), key.scope))
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        key: &PartitionKey,
        content_hash: &str,
    ) -> PathBuf {
        Self::partition_dir(fetched_at, key).join(format!("{content_hash}.json"))
    }

    /// Stage the body in a temp file, then publish it with a hard link. The
    /// link never replaces an existing artifact, so a body already archived
    /// under the same name is reported as deduplicated and left untouched.
    pub async fn store_response(
        &self,
        fetched_at: DateTime<Utc>,
        key: &PartitionKey,
        bytes: &[u8],
    ) -> Result<StoredArtifact, ArchiveError> {
        let content_hash = sha256_hex(bytes);
        let dir = self.root.join(Self::partition_dir(fetched_at, key));
        fs::create_dir_all(&dir).await.map_err(ArchiveError::at(&dir))?;

        let relative_path = self.artifact_relative_path(fetched_at, key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let staged = dir.join(format!(".{content_hash}.{}.tmp", Uuid::new_v4()));
        fs::write(&staged, bytes).await.map_err(ArchiveError::at(&staged))?;

        let published = fs::hard_link(&staged, &absolute_path).await;
        if let Err(err) = fs::remove_file(&staged).await {
            debug!(path = %staged.display(), error = %err, "could not remove staged raw artifact");
        }
        let deduplicated = match published {
            Ok(()) => false,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => true,
            Err(err) => return Err(ArchiveError::at(&absolute_path)(err)),
        };

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

/// Thin POST client. Non-success statuses are returned, not raised; callers
/// decide what a status means. Requests are never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// POST a JSON body with bearer authentication.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).bearer_auth(bearer_token).json(body);
        self.send(url, request).await
    }

    /// POST an `application/x-www-form-urlencoded` body.
    pub async fn post_form<T: Serialize + ?Sized>(
        &self,
        url: &str,
        form: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).form(form);
        self.send(url, request).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let wrap = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };

        let resp = request.send().await.map_err(wrap)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await.map_err(wrap)?.to_vec();
        debug!(%status, url = %final_url, bytes = body.len(), "http response");

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
