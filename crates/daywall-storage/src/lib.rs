//! Marker persistence, scratch artifacts and HTTP fetch utilities for daywall.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "daywall-storage";

/// `YYYY-MM-DD`, sortable and compared as plain text.
pub const MARKER_DATE_FORMAT: &str = "%Y-%m-%d";

/// Replace `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers only ever observe the old or the new contents.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// The single "last successful update" date marker.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_raw(&self) -> Option<String> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), error = %err, "marker unreadable");
                }
                None
            }
        }
    }

    /// Parsed marker date; `None` when absent or malformed.
    pub async fn read(&self) -> Option<NaiveDate> {
        let raw = self.read_raw().await?;
        NaiveDate::parse_from_str(&raw, MARKER_DATE_FORMAT).ok()
    }

    /// Fails closed: any read problem counts as "not updated".
    pub async fn was_updated_on(&self, day: NaiveDate) -> bool {
        match self.read_raw().await {
            Some(raw) => raw == day.format(MARKER_DATE_FORMAT).to_string(),
            None => false,
        }
    }

    pub async fn was_updated_today(&self) -> bool {
        self.was_updated_on(Local::now().date_naive()).await
    }

    pub async fn mark_updated_on(&self, day: NaiveDate) -> anyhow::Result<()> {
        let text = day.format(MARKER_DATE_FORMAT).to_string();
        write_atomically(&self.path, text.as_bytes())
            .await
            .with_context(|| format!("writing marker {}", self.path.display()))
    }

    pub async fn mark_updated_now(&self) -> anyhow::Result<()> {
        self.mark_updated_on(Local::now().date_naive()).await
    }
}

/// Temporary download target owned by one pipeline invocation.
/// The file is deleted when the artifact is dropped.
#[derive(Debug)]
pub struct DownloadArtifact {
    file: NamedTempFile,
}

impl DownloadArtifact {
    pub async fn create_in(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating scratch directory {}", dir.display()))?;
        let dir = dir.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("wall_")
                .tempfile_in(&dir)
                .with_context(|| format!("creating download artifact in {}", dir.display()))
        })
        .await
        .context("download artifact task failed")??;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// A fresh async handle onto the artifact, positioned at the start.
    pub fn writer(&self) -> std::io::Result<fs::File> {
        Ok(fs::File::from_std(self.file.as_file().try_clone()?))
    }

    pub async fn read_all(&self) -> std::io::Result<Vec<u8>> {
        fs::read(self.path()).await
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
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing response body: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-attempt HTTP client. Retrying is left to the next schedule slot.
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

    async fn get_success(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.get_success(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %final_url, "fetched page");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Stream the response body into `file` chunk by chunk; returns bytes written.
    pub async fn download_into(&self, url: &str, file: &mut fs::File) -> Result<u64, FetchError> {
        let span = info_span!("http_download", url);
        async {
            let mut resp = self.get_success(url).await?;
            let mut written = 0u64;
            while let Some(chunk) = resp.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            debug!(bytes = written, "downloaded body");
            Ok::<_, FetchError>(written)
        }
        .instrument(span)
        .await
    }
}
