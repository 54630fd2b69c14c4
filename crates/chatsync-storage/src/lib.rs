//! Document-store HTTP client, archive journal persistence, and request pacing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chatsync_core::Record;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chatsync-storage";

/// Largest page the store will return for a single query.
pub const MAX_PAGE_SIZE: usize = 100;

/// Durable list of archived record snapshots, rewritten as a whole on every save.
#[derive(Debug, Clone)]
pub struct JournalStore {
    path: PathBuf,
}

impl JournalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking journal path {}", self.path.display()))
    }

    /// Load every journaled snapshot. A missing file means nothing to restore.
    pub async fn load(&self) -> anyhow::Result<Vec<Record>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading journal {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing journal {}", self.path.display()))
    }

    /// Replace the journal with `entries` using an atomic temp-file rename.
    pub async fn save(&self, entries: &[Record]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries).context("serializing journal entries")?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating journal directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.journal.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp journal file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp journal file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp journal file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp journal {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        debug!(path = %self.path.display(), entries = entries.len(), "journal written");
        Ok(())
    }

    /// Delete the journal file. Returns `false` when there was nothing to delete.
    pub async fn remove(&self) -> anyhow::Result<bool> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("removing journal {}", self.path.display()))
            }
        }
    }
}

/// Fixed inter-call delay for strictly sequential writes against the store.
#[derive(Debug, Clone, Copy)]
pub struct RequestPacer {
    delay: Duration,
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl RequestPacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Sleep before every call except the first one of a batch.
    pub async fn before_call(&self, call_index: usize) {
        if call_index > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("store rejected request ({status} {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } | Self::Api { status, .. } => Some(*status),
            Self::Decode { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn error_from_body(status: StatusCode, url: &str, body: &[u8]) -> FetchError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.code.is_empty() || !parsed.message.is_empty() => FetchError::Api {
            status: status.as_u16(),
            code: parsed.code,
            message: parsed.message,
        },
        _ => FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        },
    }
}

/// One page of a cursor-paginated database query. Results stay untyped until
/// the adapter parse step so a single malformed entry cannot fail the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<JsonValue>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotionClientConfig {
    pub api_base: String,
    pub token: String,
    pub notion_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl NotionClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.notion.com/v1".to_string(),
            token: token.into(),
            notion_version: "2022-06-28".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin authenticated client for the document store's REST API.
#[derive(Debug, Clone)]
pub struct NotionHttp {
    client: reqwest::Client,
    api_base: String,
    token: String,
    notion_version: String,
}

impl NotionHttp {
    pub fn new(config: NotionClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token,
            notion_version: config.notion_version,
        })
    }

    pub async fn query_database(
        &self,
        database_id: &str,
        start_cursor: Option<&str>,
        page_size: usize,
    ) -> Result<QueryResponse, FetchError> {
        let mut body = json!({ "page_size": page_size.clamp(1, MAX_PAGE_SIZE) });
        if let Some(cursor) = start_cursor {
            body["start_cursor"] = JsonValue::String(cursor.to_string());
        }
        let url = format!("{}/databases/{database_id}/query", self.api_base);
        let value = self.send(Method::POST, &url, Some(body)).await?;
        serde_json::from_value(value).map_err(|source| FetchError::Decode { url, source })
    }

    pub async fn create_page(
        &self,
        database_id: &str,
        properties: JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/pages", self.api_base);
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        self.send(Method::POST, &url, Some(body)).await
    }

    pub async fn set_page_archived(
        &self,
        page_id: &str,
        archived: bool,
    ) -> Result<JsonValue, FetchError> {
        let url = format!("{}/pages/{page_id}", self.api_base);
        self.send(Method::PATCH, &url, Some(json!({ "archived": archived })))
            .await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<JsonValue>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("store_request", method = %method, url);
        async move {
            let mut request = self
                .client
                .request(method, url)
                .bearer_auth(&self.token)
                .header("Notion-Version", &self.notion_version);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let bytes = resp.bytes().await?;
            if !status.is_success() {
                return Err(error_from_body(status, url, &bytes));
            }
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}
