//! Status listing fetchers + raw feed archive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finale-storage";

#[derive(Debug, Clone)]
pub struct ArchivedListing {
    pub path: PathBuf,
    pub content_hash: String,
    /// The same listing was already archived for that source and day.
    pub deduplicated: bool,
}

/// Raw listings kept as `<source>/<YYYY-MM-DD>/<sha256>.html`, so markup
/// drift can be diffed after the extractor stops finding entries. A source
/// serving the same listing all day leaves a single file.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn listing_path(&self, fetched_at: DateTime<Utc>, source_id: &str, content_hash: &str) -> PathBuf {
        self.root
            .join(source_id)
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.html"))
    }

    pub async fn archive_listing(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        body: &str,
    ) -> anyhow::Result<ArchivedListing> {
        let content_hash = Self::sha256_hex(body.as_bytes());
        let path = self.listing_path(fetched_at, source_id, &content_hash);
        let dir = path
            .parent()
            .with_context(|| format!("archive path {} has no parent", path.display()))?;

        if let Some(existing) = read_if_exists(&path).await? {
            let existing_hash = Self::sha256_hex(&existing);
            if existing_hash != content_hash {
                bail!(
                    "archived listing {} is corrupt (content hashes to {existing_hash})",
                    path.display()
                );
            }
            return Ok(ArchivedListing {
                path,
                content_hash,
                deduplicated: true,
            });
        }

        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;
        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&partial, body)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("moving listing into {}", path.display()));
        }

        Ok(ArchivedListing {
            path,
            content_hash,
            deduplicated: false,
        })
    }
}

async fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Raw listing as returned by a [`StatusFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One attempt at retrieving the status listing. Implementations never retry;
/// retrying is left to whatever schedules the run.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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

    fn classify(err: reqwest::Error, url: &str) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request(err)
        }
    }
}

#[async_trait]
impl StatusFetcher for HttpFetcher {
    async fn fetch_document(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| Self::classify(err, url))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await.map_err(|err| Self::classify(err, url))?;
            debug!(bytes = body.len(), %final_url, "fetched status listing");
            Ok(FetchedDocument {
                url: final_url,
                body,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Serves a previously saved listing from disk; the `url` argument is only
/// echoed back for reporting.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StatusFetcher for FileFetcher {
    async fn fetch_document(&self, _url: &str) -> Result<FetchedDocument, FetchError> {
        let body = fs::read_to_string(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(FetchedDocument {
            url: format!("file://{}", self.path.display()),
            body,
            fetched_at: Utc::now(),
        })
    }
}
