//! Capability contracts for the document store and the messaging source, the
//! raw-page parse step, and the concrete adapters behind them.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chatsync_core::{EntityKind, Record, SourceEntity};
use chatsync_storage::{FetchError, NotionHttp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "chatsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordParseError {
    #[error("page payload is not a JSON object")]
    NotAnObject,
    #[error("page has no id")]
    MissingId,
    #[error("page {id} has no name")]
    MissingName { id: String },
}

/// Untyped page payload exactly as the store returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub JsonValue);

#[derive(Debug, Clone, Default)]
pub struct PageBatch {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Names of the store properties that feed each `Record` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertySchema {
    pub name: String,
    pub status: String,
    pub priority: String,
    pub pipeline: String,
    pub all_networks: String,
    /// Checked in order; the first non-empty value wins.
    pub owner: Vec<String>,
}

impl Default for PropertySchema {
    fn default() -> Self {
        Self {
            name: "Name".to_string(),
            status: "Status".to_string(),
            priority: "Priority".to_string(),
            pipeline: "Pipeline".to_string(),
            all_networks: "All Networks".to_string(),
            owner: vec!["Owner".to_string(), "Owner Name".to_string()],
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn schema(&self) -> &PropertySchema;

    async fn query_page(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<PageBatch, AdapterError>;

    async fn create_record(&self, name: &str) -> Result<RawRecord, AdapterError>;

    async fn set_archived(&self, id: &str, archived: bool) -> Result<(), AdapterError>;
}

/// Messaging platform capability. The session is owned by the caller and
/// passed into every query; nothing is cached inside the adapter.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    type Session: Send + Sync;

    fn platform_id(&self) -> &'static str;

    async fn login(&self) -> Result<Self::Session, AdapterError>;

    async fn query_entities(
        &self,
        session: &Self::Session,
        pattern: &str,
    ) -> Result<Vec<SourceEntity>, AdapterError>;

    async fn disconnect(&self, session: Self::Session) -> Result<(), AdapterError>;
}

pub fn parse_record(raw: &RawRecord, schema: &PropertySchema) -> Result<Record, RecordParseError> {
    let page = raw.0.as_object().ok_or(RecordParseError::NotAnObject)?;
    let id = page
        .get("id")
        .and_then(JsonValue::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or(RecordParseError::MissingId)?
        .to_string();
    let empty = JsonMap::new();
    let properties = page
        .get("properties")
        .and_then(JsonValue::as_object)
        .unwrap_or(&empty);

    let name = properties
        .get(&schema.name)
        .and_then(property_text)
        .ok_or_else(|| RecordParseError::MissingName { id: id.clone() })?;

    let owner = schema
        .owner
        .iter()
        .find_map(|candidate| properties.get(candidate).and_then(property_text));

    let created_time = page
        .get("created_time")
        .and_then(JsonValue::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Ok(Record {
        id,
        name,
        status: properties.get(&schema.status).and_then(property_text),
        priority: properties.get(&schema.priority).and_then(property_text),
        pipeline: properties.get(&schema.pipeline).and_then(property_text),
        all_networks: properties.get(&schema.all_networks).and_then(property_tags),
        owner,
        created_time,
    })
}

fn property_type(prop: &JsonValue) -> Option<&str> {
    if let Some(kind) = prop.get("type").and_then(JsonValue::as_str) {
        return Some(kind);
    }
    const KNOWN: [&str; 8] = [
        "title",
        "rich_text",
        "select",
        "status",
        "multi_select",
        "people",
        "email",
        "url",
    ];
    KNOWN.into_iter().find(|kind| prop.get(*kind).is_some())
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn plain_text(fragments: &JsonValue) -> Option<String> {
    let joined = fragments
        .as_array()?
        .iter()
        .filter_map(|fragment| {
            fragment
                .get("plain_text")
                .or_else(|| fragment.get("text").and_then(|t| t.get("content")))
                .and_then(JsonValue::as_str)
        })
        .collect::<String>();
    non_blank(joined)
}

fn option_name(option: &JsonValue) -> Option<String> {
    option
        .get("name")
        .and_then(JsonValue::as_str)
        .and_then(|name| non_blank(name.to_string()))
}

fn property_text(prop: &JsonValue) -> Option<String> {
    let kind = property_type(prop)?;
    let value = prop.get(kind)?;
    match kind {
        "title" | "rich_text" => plain_text(value),
        "select" | "status" => option_name(value),
        "people" => value.as_array()?.iter().find_map(option_name),
        "multi_select" => {
            let names = value.as_array()?.iter().filter_map(option_name).collect::<Vec<_>>();
            non_blank(names.join(", "))
        }
        _ => value.as_str().and_then(|s| non_blank(s.to_string())),
    }
}

fn property_tags(prop: &JsonValue) -> Option<Vec<String>> {
    match property_type(prop)? {
        "multi_select" => Some(
            prop.get("multi_select")?
                .as_array()
                .map(|options| options.iter().filter_map(option_name).collect())
                .unwrap_or_default(),
        ),
        _ => property_text(prop).map(|single| vec![single]),
    }
}

/// Render a record in the store's page shape; the inverse of [`parse_record`].
pub fn record_to_page(record: &Record, schema: &PropertySchema) -> JsonValue {
    let mut properties = JsonMap::new();
    properties.insert(
        schema.name.clone(),
        json!({ "type": "title", "title": [{ "plain_text": record.name }] }),
    );
    for (key, value) in [
        (&schema.status, &record.status),
        (&schema.priority, &record.priority),
        (&schema.pipeline, &record.pipeline),
    ] {
        if let Some(value) = value {
            properties.insert(key.clone(), json!({ "type": "select", "select": { "name": value } }));
        }
    }
    if let Some(tags) = &record.all_networks {
        let options = tags.iter().map(|t| json!({ "name": t })).collect::<Vec<_>>();
        properties.insert(
            schema.all_networks.clone(),
            json!({ "type": "multi_select", "multi_select": options }),
        );
    }
    if let (Some(owner), Some(key)) = (&record.owner, schema.owner.first()) {
        properties.insert(
            key.clone(),
            json!({ "type": "people", "people": [{ "object": "user", "name": owner }] }),
        );
    }

    let mut page = json!({
        "object": "page",
        "id": record.id,
        "archived": false,
        "properties": properties,
    });
    if let Some(created) = record.created_time {
        page["created_time"] = JsonValue::String(created.to_rfc3339());
    }
    page
}

fn title_properties(schema: &PropertySchema, title: &str) -> JsonValue {
    let mut properties = JsonMap::new();
    properties.insert(
        schema.name.clone(),
        json!({ "title": [{ "text": { "content": title } }] }),
    );
    JsonValue::Object(properties)
}

/// Document store backed by a database in the hosted workspace API.
#[derive(Debug, Clone)]
pub struct NotionStore {
    http: NotionHttp,
    database_id: String,
    schema: PropertySchema,
}

impl NotionStore {
    pub fn new(http: NotionHttp, database_id: impl Into<String>, schema: PropertySchema) -> Self {
        Self {
            http,
            database_id: database_id.into(),
            schema,
        }
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }

    async fn query_page(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<PageBatch, AdapterError> {
        let resp = self
            .http
            .query_database(&self.database_id, cursor, page_size)
            .await?;
        Ok(PageBatch {
            records: resp.results.into_iter().map(RawRecord).collect(),
            has_more: resp.has_more,
            next_cursor: resp.next_cursor,
        })
    }

    async fn create_record(&self, name: &str) -> Result<RawRecord, AdapterError> {
        let page = self
            .http
            .create_page(&self.database_id, title_properties(&self.schema, name))
            .await?;
        Ok(RawRecord(page))
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<(), AdapterError> {
        self.http.set_page_archived(id, archived).await?;
        Ok(())
    }
}

/// One dialog as written by a messaging-client export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedDialog {
    pub id: i64,
    #[serde(default = "unknown_kind")]
    pub kind: EntityKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub participants_count: Option<u64>,
    #[serde(default)]
    pub about: Option<String>,
}

fn unknown_kind() -> EntityKind {
    EntityKind::Unknown
}

impl ExportedDialog {
    /// Title shown to users: chat title, else the person's full name, else the username.
    pub fn display_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let full_name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        if !full_name.trim().is_empty() {
            return full_name.trim().to_string();
        }
        self.username.clone().unwrap_or_default()
    }

    fn to_entity(&self) -> SourceEntity {
        SourceEntity {
            title: self.display_title(),
            id: self.id,
            kind: self.kind,
            username: self.username.clone().filter(|u| !u.is_empty()),
            member_count: self.participants_count.filter(|count| *count > 0),
            description: self.about.clone().filter(|about| !about.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogExport {
    #[serde(default)]
    pub dialogs: Vec<ExportedDialog>,
}

/// Logged-in view over an export: the dialog list loaded at login.
#[derive(Debug, Clone)]
pub struct ExportSession {
    dialogs: Vec<ExportedDialog>,
}

impl ExportSession {
    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }
}

/// Source platform that reads a JSON dialog export instead of a live connection.
#[derive(Debug, Clone)]
pub struct ExportFileSource {
    path: PathBuf,
}

impl ExportFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourcePlatform for ExportFileSource {
    type Session = ExportSession;

    fn platform_id(&self) -> &'static str {
        "dialog-export"
    }

    async fn login(&self) -> Result<ExportSession, AdapterError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading dialog export {}", self.path.display()))?;
        let export: DialogExport = serde_json::from_str(&raw)
            .with_context(|| format!("parsing dialog export {}", self.path.display()))?;
        info!(dialogs = export.dialogs.len(), path = %self.path.display(), "dialog export loaded");
        Ok(ExportSession {
            dialogs: export.dialogs,
        })
    }

    async fn query_entities(
        &self,
        session: &ExportSession,
        pattern: &str,
    ) -> Result<Vec<SourceEntity>, AdapterError> {
        let needle = pattern.to_lowercase().trim().to_string();
        let matching = session
            .dialogs
            .iter()
            .filter(|dialog| dialog.display_title().to_lowercase().contains(&needle))
            .map(ExportedDialog::to_entity)
            .collect::<Vec<_>>();

        if matching.is_empty() {
            let sample = session
                .dialogs
                .iter()
                .take(10)
                .map(ExportedDialog::display_title)
                .collect::<Vec<_>>();
            info!(pattern, available = ?sample, total = session.dialogs.len(), "no chats matched pattern");
        } else {
            info!(pattern, matched = matching.len(), "chats matched pattern");
        }
        Ok(matching)
    }

    async fn disconnect(&self, session: ExportSession) -> Result<(), AdapterError> {
        drop(session);
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryPage {
    id: Option<String>,
    raw: JsonValue,
    archived: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    pages: Vec<MemoryPage>,
    next_id: u64,
    query_calls: usize,
    set_archived_calls: usize,
    fail_query_on_call: Option<usize>,
    fail_archive: HashSet<String>,
    fail_restore: HashSet<String>,
    fail_create: HashSet<String>,
}

/// In-process document store with failure injection, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    schema: PropertySchema,
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new(schema: PropertySchema) -> Self {
        Self {
            schema,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_records(records: &[Record]) -> Self {
        let schema = PropertySchema::default();
        let pages = records
            .iter()
            .map(|record| MemoryPage {
                id: Some(record.id.clone()),
                raw: record_to_page(record, &schema),
                archived: false,
            })
            .collect();
        Self {
            schema,
            state: Mutex::new(MemoryState {
                pages,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn push_raw(&self, raw: JsonValue) {
        let id = raw.get("id").and_then(JsonValue::as_str).map(str::to_string);
        self.state.lock().await.pages.push(MemoryPage {
            id,
            raw,
            archived: false,
        });
    }

    pub async fn fail_query_on_call(&self, call: usize) {
        self.state.lock().await.fail_query_on_call = Some(call);
    }

    pub async fn fail_archive_for(&self, id: &str) {
        self.state.lock().await.fail_archive.insert(id.to_string());
    }

    pub async fn fail_restore_for(&self, id: &str) {
        self.state.lock().await.fail_restore.insert(id.to_string());
    }

    pub async fn fail_create_for(&self, name: &str) {
        self.state.lock().await.fail_create.insert(name.to_string());
    }

    pub async fn query_calls(&self) -> usize {
        self.state.lock().await.query_calls
    }

    pub async fn set_archived_calls(&self) -> usize {
        self.state.lock().await.set_archived_calls
    }

    pub async fn is_archived(&self, id: &str) -> Option<bool> {
        self.state
            .lock()
            .await
            .pages
            .iter()
            .find(|page| page.id.as_deref() == Some(id))
            .map(|page| page.archived)
    }

    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .pages
            .iter()
            .filter(|page| !page.archived)
            .count()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn schema(&self) -> &PropertySchema {
        &self.schema
    }

    async fn query_page(
        &self,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<PageBatch, AdapterError> {
        let mut state = self.state.lock().await;
        state.query_calls += 1;
        if state.fail_query_on_call == Some(state.query_calls) {
            return Err(AdapterError::Message(format!(
                "injected query failure on call {}",
                state.query_calls
            )));
        }

        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| AdapterError::Message(format!("invalid cursor {cursor}")))?,
            None => 0,
        };
        let active = state
            .pages
            .iter()
            .filter(|page| !page.archived)
            .collect::<Vec<_>>();
        let end = (offset + page_size.max(1)).min(active.len());
        let records = active
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|page| RawRecord(page.raw.clone()))
            .collect();
        let has_more = end < active.len();
        Ok(PageBatch {
            records,
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
        })
    }

    async fn create_record(&self, name: &str) -> Result<RawRecord, AdapterError> {
        let mut state = self.state.lock().await;
        if state.fail_create.contains(name) {
            return Err(AdapterError::Message(format!("injected create failure for {name}")));
        }
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let raw = record_to_page(&Record::named(id.clone(), name), &self.schema);
        state.pages.push(MemoryPage {
            id: Some(id),
            raw: raw.clone(),
            archived: false,
        });
        Ok(RawRecord(raw))
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        state.set_archived_calls += 1;
        let failing = if archived {
            &state.fail_archive
        } else {
            &state.fail_restore
        };
        if failing.contains(id) {
            return Err(AdapterError::Message(format!(
                "injected {} failure for {id}",
                if archived { "archive" } else { "restore" }
            )));
        }
        let page = state
            .pages
            .iter_mut()
            .find(|page| page.id.as_deref() == Some(id))
            .ok_or_else(|| AdapterError::Message(format!("no page with id {id}")))?;
        page.archived = archived;
        Ok(())
    }
}
