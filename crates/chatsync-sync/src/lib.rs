//! Reconciliation pipeline: keeps the document store in step with the
//! messaging source and free of same-named duplicates.

pub mod archive;
pub mod matcher;
pub mod paginate;
pub mod ranker;
pub mod resolver;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chatsync_adapters::{DocumentStore, ExportFileSource, NotionStore, PropertySchema, SourcePlatform};
use chatsync_core::{Record, SourceEntity};
use chatsync_storage::{JournalStore, NotionClientConfig, NotionHttp, RequestPacer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use archive::{add_records, ArchiveEngine, ArchiveOutcome, BatchOutcome, RestoreOutcome};
pub use matcher::{find_new, partition_entities, IdentityMatch};
pub use paginate::{PaginationStats, Paginator};
pub use ranker::{completeness_cmp, rank, CompletenessKey, Ranked, PLACEHOLDER_STATUS};
pub use resolver::{find_duplicates, resolve_duplicates, DuplicateGroup, DuplicateResolution};

pub const CRATE_NAME: &str = "chatsync-sync";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set in environment variables")]
    Missing(&'static str),
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub notion_token: String,
    pub notion_database_id: String,
    pub notion_api_base: String,
    pub notion_version: String,
    pub journal_path: PathBuf,
    pub pace_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub properties_path: PathBuf,
    pub export_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Credentials are checked here so a
    /// missing one fails before any request is made.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let number = |key: &'static str, default: u64| match get(key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid { var: key, value }),
            None => Ok(default),
        };

        Ok(Self {
            notion_token: required("NOTION_TOKEN")?,
            notion_database_id: required("NOTION_DATABASE_ID")?,
            notion_api_base: get("NOTION_API_BASE")
                .unwrap_or_else(|| "https://api.notion.com/v1".to_string()),
            notion_version: get("NOTION_VERSION").unwrap_or_else(|| "2022-06-28".to_string()),
            journal_path: get("CHATSYNC_JOURNAL")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./archived_duplicates.json")),
            pace_ms: number("CHATSYNC_PACE_MS", 100)?,
            http_timeout_secs: number("CHATSYNC_HTTP_TIMEOUT_SECS", 20)?,
            user_agent: get("CHATSYNC_USER_AGENT").unwrap_or_else(|| "chatsync/0.1".to_string()),
            properties_path: get("CHATSYNC_PROPERTIES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./properties.yaml")),
            export_path: get("TELEGRAM_EXPORT_PATH").map(PathBuf::from),
        })
    }

    pub fn pacer(&self) -> RequestPacer {
        RequestPacer::new(Duration::from_millis(self.pace_ms))
    }

    pub fn export_source(&self) -> Result<ExportFileSource, ConfigError> {
        self.export_path
            .as_ref()
            .map(ExportFileSource::new)
            .ok_or(ConfigError::Missing("TELEGRAM_EXPORT_PATH"))
    }
}

/// Read the property-name mapping; an absent file means the default names.
pub fn load_property_schema(path: &Path) -> Result<PropertySchema> {
    if !path.exists() {
        return Ok(PropertySchema::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pattern: String,
    pub store_records: usize,
    pub source_entities: usize,
    pub existing: usize,
    pub new_entities: Vec<SourceEntity>,
    /// `None` when the run only looked for new chats.
    pub created: Option<BatchOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: usize,
    pub groups: Vec<DuplicateGroup>,
    pub duplicates: usize,
    pub dry_run: bool,
    pub archive: Option<ArchiveOutcome>,
    pub journal_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RestoreOutcome,
    pub journal_path: String,
}

/// One batch reconciliation against a document store. Every external call is
/// awaited before the next is issued.
pub struct Reconciler<S: DocumentStore> {
    store: S,
    journal: JournalStore,
    pacer: RequestPacer,
}

impl<S: DocumentStore> Reconciler<S> {
    pub fn new(store: S, journal: JournalStore, pacer: RequestPacer) -> Self {
        Self {
            store,
            journal,
            pacer,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn journal(&self) -> &JournalStore {
        &self.journal
    }

    pub async fn list_records(&self) -> Result<Vec<Record>> {
        Paginator::new(&self.store).fetch_all().await
    }

    pub async fn find_new<P: SourcePlatform>(
        &self,
        platform: &P,
        pattern: &str,
    ) -> Result<SyncRunSummary> {
        self.run_against_source(platform, pattern, false).await
    }

    pub async fn sync_new<P: SourcePlatform>(
        &self,
        platform: &P,
        pattern: &str,
    ) -> Result<SyncRunSummary> {
        self.run_against_source(platform, pattern, true).await
    }

    async fn run_against_source<P: SourcePlatform>(
        &self,
        platform: &P,
        pattern: &str,
        create: bool,
    ) -> Result<SyncRunSummary> {
        let session = platform
            .login()
            .await
            .with_context(|| format!("logging in to {}", platform.platform_id()))?;
        let result = self.reconcile_source(platform, &session, pattern, create).await;
        if let Err(err) = platform.disconnect(session).await {
            warn!(platform = platform.platform_id(), error = %err, "disconnect failed");
        }
        result
    }

    async fn reconcile_source<P: SourcePlatform>(
        &self,
        platform: &P,
        session: &P::Session,
        pattern: &str,
        create: bool,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let entities = platform
            .query_entities(session, pattern)
            .await
            .with_context(|| format!("querying {} for {pattern:?}", platform.platform_id()))?;
        let records = self.list_records().await?;
        let split = partition_entities(&records, &entities);
        info!(
            %run_id,
            existing = split.existing.len(),
            new = split.new.len(),
            "matched source chats against store"
        );

        let created = if create && !split.new.is_empty() {
            Some(add_records(&self.store, &split.new, &self.pacer).await)
        } else if create {
            Some(BatchOutcome::default())
        } else {
            None
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pattern: pattern.to_string(),
            store_records: records.len(),
            source_entities: entities.len(),
            existing: split.existing.len(),
            new_entities: split.new,
            created,
        })
    }

    pub async fn dedupe(&self, dry_run: bool) -> Result<DedupeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let records = self.list_records().await?;
        let resolution = resolve_duplicates(&records);
        info!(
            %run_id,
            scanned = records.len(),
            duplicates = resolution.losers.len(),
            "resolved duplicates"
        );

        let archive = if dry_run || resolution.losers.is_empty() {
            None
        } else {
            let engine = ArchiveEngine::new(&self.store, &self.journal, self.pacer);
            Some(engine.archive(&resolution.losers).await?)
        };

        Ok(DedupeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scanned: records.len(),
            groups: resolution.groups(),
            duplicates: resolution.losers.len(),
            dry_run,
            archive,
            journal_path: self.journal.path().display().to_string(),
        })
    }

    pub async fn restore(&self) -> Result<RestoreRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let outcome = ArchiveEngine::new(&self.store, &self.journal, self.pacer)
            .restore()
            .await?;
        Ok(RestoreRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            journal_path: self.journal.path().display().to_string(),
        })
    }
}

pub fn reconciler_from_config(config: &SyncConfig) -> Result<Reconciler<NotionStore>> {
    let schema = load_property_schema(&config.properties_path)?;
    let http = NotionHttp::new(NotionClientConfig {
        api_base: config.notion_api_base.clone(),
        token: config.notion_token.clone(),
        notion_version: config.notion_version.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = NotionStore::new(http, config.notion_database_id.clone(), schema);
    Ok(Reconciler::new(
        store,
        JournalStore::new(config.journal_path.clone()),
        config.pacer(),
    ))
}

pub fn reconciler_from_env() -> Result<(SyncConfig, Reconciler<NotionStore>)> {
    let config = SyncConfig::from_env()?;
    let reconciler = reconciler_from_config(&config)?;
    Ok((config, reconciler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake_source::FakeSource;
    use chatsync_adapters::MemoryDocumentStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    mod fake_source {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use chatsync_adapters::{AdapterError, SourcePlatform};
        use chatsync_core::{EntityKind, SourceEntity};

        /// Source whose session is just the chat list, counting lifecycle calls.
        pub struct FakeSource {
            pub titles: Vec<&'static str>,
            pub fail_query: bool,
            pub disconnects: AtomicUsize,
        }

        impl FakeSource {
            pub fn new(titles: Vec<&'static str>) -> Self {
                Self {
                    titles,
                    fail_query: false,
                    disconnects: AtomicUsize::new(0),
                }
            }

            pub fn disconnects(&self) -> usize {
                self.disconnects.load(Ordering::SeqCst)
            }
        }

        #[async_trait::async_trait]
        impl SourcePlatform for FakeSource {
            type Session = Vec<SourceEntity>;

            fn platform_id(&self) -> &'static str {
                "fake"
            }

            async fn login(&self) -> Result<Vec<SourceEntity>, AdapterError> {
                Ok(self
                    .titles
                    .iter()
                    .enumerate()
                    .map(|(i, title)| SourceEntity {
                        title: title.to_string(),
                        id: i as i64,
                        kind: EntityKind::Group,
                        username: None,
                        member_count: None,
                        description: None,
                    })
                    .collect())
            }

            async fn query_entities(
                &self,
                session: &Vec<SourceEntity>,
                pattern: &str,
            ) -> Result<Vec<SourceEntity>, AdapterError> {
                if self.fail_query {
                    return Err(AdapterError::Message("source offline".into()));
                }
                let needle = pattern.to_lowercase();
                Ok(session
                    .iter()
                    .filter(|e| e.title.to_lowercase().contains(&needle))
                    .cloned()
                    .collect())
            }

            async fn disconnect(&self, _session: Vec<SourceEntity>) -> Result<(), AdapterError> {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    fn reconciler(records: &[Record], journal: PathBuf) -> Reconciler<MemoryDocumentStore> {
        Reconciler::new(
            MemoryDocumentStore::with_records(records),
            JournalStore::new(journal),
            RequestPacer::new(Duration::ZERO),
        )
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = SyncConfig::from_lookup(env(&[])).expect_err("token missing");
        assert_eq!(err, ConfigError::Missing("NOTION_TOKEN"));
        assert_eq!(err.to_string(), "NOTION_TOKEN must be set in environment variables");

        let err = SyncConfig::from_lookup(env(&[("NOTION_TOKEN", "secret"), ("NOTION_DATABASE_ID", " ")]))
            .expect_err("database missing");
        assert_eq!(err, ConfigError::Missing("NOTION_DATABASE_ID"));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(env(&[
            ("NOTION_TOKEN", "secret"),
            ("NOTION_DATABASE_ID", "db1"),
            ("CHATSYNC_PACE_MS", "250"),
        ]))
        .expect("config");
        assert_eq!(config.pace_ms, 250);
        assert_eq!(config.pacer().delay(), Duration::from_millis(250));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.journal_path, PathBuf::from("./archived_duplicates.json"));
        assert_eq!(
            config.export_source().expect_err("no export"),
            ConfigError::Missing("TELEGRAM_EXPORT_PATH")
        );

        let err = SyncConfig::from_lookup(env(&[
            ("NOTION_TOKEN", "secret"),
            ("NOTION_DATABASE_ID", "db1"),
            ("CHATSYNC_PACE_MS", "fast"),
        ]))
        .expect_err("invalid pace");
        assert!(matches!(err, ConfigError::Invalid { var: "CHATSYNC_PACE_MS", .. }));
    }

    #[test]
    fn property_schema_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let missing = load_property_schema(&dir.path().join("none.yaml")).expect("default");
        assert_eq!(missing, PropertySchema::default());

        let path = dir.path().join("properties.yaml");
        std::fs::write(&path, "name: Chat\nowner: [Lead, Lead Text]\n").expect("write yaml");
        let schema = load_property_schema(&path).expect("schema");
        assert_eq!(schema.name, "Chat");
        assert_eq!(schema.owner, vec!["Lead".to_string(), "Lead Text".to_string()]);
        assert_eq!(schema.status, "Status");
    }

    #[test]
    fn checked_in_property_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/properties.yaml");
        let schema = load_property_schema(&path).expect("schema");
        assert_eq!(schema, PropertySchema::default());
    }

    #[tokio::test]
    async fn sync_creates_only_unseen_chats_and_disconnects() {
        let dir = tempdir().expect("tempdir");
        let reconciler = reconciler(
            &[Record::named("p1", "Envio Chat")],
            dir.path().join("journal.json"),
        );
        let source = FakeSource::new(vec!["envio chat", "Envio Builders", "Other"]);

        let found = reconciler.find_new(&source, "envio").await.expect("find new");
        assert_eq!(found.existing, 1);
        assert_eq!(found.new_entities.len(), 1);
        assert!(found.created.is_none());
        assert_eq!(reconciler.store().active_count().await, 1);

        let synced = reconciler.sync_new(&source, "envio").await.expect("sync");
        assert_eq!(synced.created, Some(BatchOutcome { succeeded: 1, failed: 0 }));
        assert_eq!(reconciler.store().active_count().await, 2);

        let again = reconciler.sync_new(&source, "envio").await.expect("resync");
        assert!(again.new_entities.is_empty());
        assert_eq!(again.created, Some(BatchOutcome::default()));
        assert_eq!(source.disconnects(), 3);
    }

    #[tokio::test]
    async fn source_failures_still_disconnect() {
        let dir = tempdir().expect("tempdir");
        let reconciler = reconciler(&[], dir.path().join("journal.json"));
        let mut source = FakeSource::new(vec!["Alpha"]);
        source.fail_query = true;

        let err = reconciler.sync_new(&source, "a").await.expect_err("query fails");
        assert!(format!("{err:#}").contains("source offline"));
        assert_eq!(source.disconnects(), 1);
    }

    #[tokio::test]
    async fn dedupe_archives_losers_and_restore_undoes_it() {
        let dir = tempdir().expect("tempdir");
        let journal_path = dir.path().join("journal.json");
        let mut kept = Record::named("a2", "alpha");
        kept.status = Some("Active".into());
        let records = vec![
            Record::named("a1", "Alpha"),
            kept,
            Record::named("b1", "Beta"),
            Record::named("a3", " ALPHA "),
        ];
        let reconciler = reconciler(&records, journal_path.clone());

        let preview = reconciler.dedupe(true).await.expect("dry run");
        assert_eq!(preview.duplicates, 2);
        assert!(preview.archive.is_none());
        assert_eq!(preview.groups.len(), 1);
        assert_eq!(preview.groups[0].kept.id, "a2");
        assert_eq!(reconciler.store().active_count().await, 4);
        assert!(!journal_path.exists());

        let run = reconciler.dedupe(false).await.expect("dedupe");
        let archive = run.archive.expect("archive outcome");
        assert_eq!(archive.archived_count, 2);
        assert_eq!(reconciler.store().active_count().await, 2);
        assert!(journal_path.exists());

        let clean = reconciler.dedupe(false).await.expect("second dedupe");
        assert_eq!(clean.duplicates, 0);
        assert!(clean.archive.is_none());

        let restored = reconciler.restore().await.expect("restore");
        assert_eq!(restored.outcome.restored_count, 2);
        assert_eq!(reconciler.store().active_count().await, 4);
        assert!(!journal_path.exists());
    }
}
