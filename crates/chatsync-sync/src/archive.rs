//! Sequential, paced write batches: record creation, archival with an undo
//! journal, and restoration from that journal.

use anyhow::{Context, Result};
use chatsync_adapters::{parse_record, DocumentStore};
use chatsync_core::{Record, SourceEntity};
use chatsync_storage::{JournalStore, RequestPacer};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Create one store record per entity, one call at a time.
pub async fn add_records<S: DocumentStore + ?Sized>(
    store: &S,
    entities: &[SourceEntity],
    pacer: &RequestPacer,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for (index, entity) in entities.iter().enumerate() {
        pacer.before_call(index).await;
        match store.create_record(&entity.title).await {
            Ok(raw) => {
                outcome.succeeded += 1;
                let id = parse_record(&raw, store.schema())
                    .map(|record| record.id)
                    .unwrap_or_default();
                info!(title = %entity.title, id = %id, "record created");
            }
            Err(err) => {
                outcome.failed += 1;
                warn!(title = %entity.title, error = %err, "failed to create record");
            }
        }
    }
    outcome
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub archived_count: usize,
    pub failed_count: usize,
    /// Snapshots written to the journal, in archive order.
    pub journal: Vec<Record>,
    /// Unrestored entries from an earlier journal that this run replaced.
    pub discarded_prior: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub restored_count: usize,
    pub failed_count: usize,
    /// Entries still journaled because their restore call failed.
    pub remaining: Vec<Record>,
    pub journal_removed: bool,
}

/// Archives duplicate losers and undoes that archival later from a journal.
/// Assumes a single invocation at a time; the journal file is not locked.
pub struct ArchiveEngine<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    journal: &'a JournalStore,
    pacer: RequestPacer,
}

impl<'a, S: DocumentStore + ?Sized> ArchiveEngine<'a, S> {
    pub fn new(store: &'a S, journal: &'a JournalStore, pacer: RequestPacer) -> Self {
        Self {
            store,
            journal,
            pacer,
        }
    }

    pub async fn archive(&self, duplicates: &[Record]) -> Result<ArchiveOutcome> {
        let mut outcome = ArchiveOutcome::default();

        for (index, record) in duplicates.iter().enumerate() {
            self.pacer.before_call(index).await;
            match self.store.set_archived(&record.id, true).await {
                Ok(()) => {
                    outcome.archived_count += 1;
                    outcome.journal.push(record.clone());
                    info!(id = %record.id, name = %record.name, "archived duplicate");
                }
                Err(err) => {
                    outcome.failed_count += 1;
                    warn!(id = %record.id, name = %record.name, error = %err, "failed to archive duplicate");
                }
            }
        }

        // Nothing reached the store, so a prior journal stays restorable.
        if outcome.journal.is_empty() {
            return Ok(outcome);
        }

        // The store is already mutated here; an unreadable prior journal must
        // not stop the new one from being written.
        match self.journal.load().await {
            Ok(prior) if !prior.is_empty() => {
                outcome.discarded_prior = prior.len();
                warn!(
                    discarded = prior.len(),
                    path = %self.journal.path().display(),
                    "overwriting journal that still holds unrestored entries"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(
                path = %self.journal.path().display(),
                error = %err,
                "replacing unreadable archive journal"
            ),
        }

        self.journal.save(&outcome.journal).await.with_context(|| {
            format!(
                "writing archive journal after archiving {} records",
                outcome.archived_count
            )
        })?;
        Ok(outcome)
    }

    pub async fn restore(&self) -> Result<RestoreOutcome> {
        let mut outcome = RestoreOutcome::default();
        if !self.journal.exists().await? {
            info!(path = %self.journal.path().display(), "no archive journal; nothing to restore");
            return Ok(outcome);
        }

        let entries = self
            .journal
            .load()
            .await
            .context("reading archive journal")?;
        for (index, record) in entries.into_iter().enumerate() {
            self.pacer.before_call(index).await;
            match self.store.set_archived(&record.id, false).await {
                Ok(()) => {
                    outcome.restored_count += 1;
                    info!(id = %record.id, name = %record.name, "restored record");
                }
                Err(err) => {
                    outcome.failed_count += 1;
                    warn!(id = %record.id, name = %record.name, error = %err, "failed to restore record");
                    outcome.remaining.push(record);
                }
            }
        }

        if outcome.remaining.is_empty() {
            outcome.journal_removed = self.journal.remove().await?;
        } else {
            self.journal
                .save(&outcome.remaining)
                .await
                .context("rewriting archive journal with unrestored entries")?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_adapters::MemoryDocumentStore;
    use chatsync_core::EntityKind;
    use std::time::Duration;
    use tempfile::tempdir;

    fn rec(id: &str, name: &str) -> Record {
        Record::named(id, name)
    }

    fn no_delay() -> RequestPacer {
        RequestPacer::new(Duration::ZERO)
    }

    #[tokio::test]
    async fn archive_then_restore_round_trips() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta"), rec("c", "Gamma")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());

        let archived = engine.archive(&records[..2]).await.expect("archive");
        assert_eq!(archived.archived_count, 2);
        assert_eq!(archived.failed_count, 0);
        assert_eq!(store.active_count().await, 1);
        assert_eq!(journal.load().await.expect("load"), records[..2].to_vec());

        let restored = engine.restore().await.expect("restore");
        assert_eq!(restored.restored_count, 2);
        assert!(restored.journal_removed);
        assert_eq!(store.active_count().await, 3);
        assert!(!journal.path().exists());
    }

    #[tokio::test]
    async fn failed_archives_are_counted_and_not_journaled() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta"), rec("c", "Gamma")];
        let store = MemoryDocumentStore::with_records(&records);
        store.fail_archive_for("b").await;
        let engine = ArchiveEngine::new(&store, &journal, no_delay());

        let outcome = engine.archive(&records).await.expect("archive");
        assert_eq!(outcome.archived_count, 2);
        assert_eq!(outcome.failed_count, 1);
        assert_eq!(store.set_archived_calls().await, 3);
        let journaled = journal.load().await.expect("load");
        assert_eq!(journaled, vec![rec("a", "Alpha"), rec("c", "Gamma")]);
    }

    #[tokio::test]
    async fn partial_restore_keeps_only_failed_entries() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());
        engine.archive(&records).await.expect("archive");

        store.fail_restore_for("b").await;
        let outcome = engine.restore().await.expect("restore");
        assert_eq!(outcome.restored_count, 1);
        assert_eq!(outcome.failed_count, 1);
        assert!(!outcome.journal_removed);
        assert_eq!(journal.load().await.expect("load"), vec![rec("b", "Beta")]);
        assert_eq!(store.is_archived("a").await, Some(false));
        assert_eq!(store.is_archived("b").await, Some(true));
    }

    #[tokio::test]
    async fn restore_without_journal_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("missing.json"));
        let store = MemoryDocumentStore::with_records(&[rec("a", "Alpha")]);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());

        let outcome = engine.restore().await.expect("restore");
        assert_eq!(outcome, RestoreOutcome::default());
        assert_eq!(store.set_archived_calls().await, 0);
    }

    #[tokio::test]
    async fn rearchiving_overwrites_unrestored_journal() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta"), rec("c", "Gamma")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());

        engine.archive(&records[..2]).await.expect("first archive");
        let second = engine.archive(&records[2..]).await.expect("second archive");
        assert_eq!(second.discarded_prior, 2);
        assert_eq!(journal.load().await.expect("load"), vec![rec("c", "Gamma")]);
    }

    #[tokio::test]
    async fn fully_failed_archive_leaves_prior_journal_alone() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());
        engine.archive(&records[..1]).await.expect("first archive");

        store.fail_archive_for("b").await;
        let outcome = engine.archive(&records[1..]).await.expect("second archive");
        assert_eq!(outcome.archived_count, 0);
        assert_eq!(journal.load().await.expect("load"), vec![rec("a", "Alpha")]);
    }

    #[tokio::test]
    async fn unreadable_prior_journal_is_replaced_after_archiving() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archived.json");
        std::fs::write(&path, "{ not json").expect("seed journal");
        let journal = JournalStore::new(&path);
        let records = vec![rec("a", "Alpha"), rec("b", "Beta")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, no_delay());

        let outcome = engine.archive(&records).await.expect("archive");
        assert_eq!(outcome.archived_count, 2);
        assert_eq!(outcome.discarded_prior, 0);
        assert_eq!(store.active_count().await, 0);
        assert_eq!(journal.load().await.expect("load"), records);
    }

    #[tokio::test(start_paused = true)]
    async fn archive_and_restore_wait_between_store_calls() {
        let dir = tempdir().expect("tempdir");
        let journal = JournalStore::new(dir.path().join("archived.json"));
        let records = vec![rec("a", "Alpha"), rec("b", "Beta"), rec("c", "Gamma")];
        let store = MemoryDocumentStore::with_records(&records);
        let engine = ArchiveEngine::new(&store, &journal, RequestPacer::new(Duration::from_millis(100)));

        let started = tokio::time::Instant::now();
        engine.archive(&records).await.expect("archive");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "archive took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "archive took {elapsed:?}");

        let started = tokio::time::Instant::now();
        engine.restore().await.expect("restore");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "restore took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "restore took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn add_records_paces_calls_after_the_first() {
        let store = MemoryDocumentStore::with_records(&[]);
        let pacer = RequestPacer::new(Duration::from_millis(100));
        let entities = ["One", "Two", "Three"]
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
            .collect::<Vec<_>>();

        let started = tokio::time::Instant::now();
        add_records(&store, &entities[..1], &pacer).await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = tokio::time::Instant::now();
        let outcome = add_records(&store, &entities, &pacer).await;
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn add_records_counts_failures_and_continues() {
        let store = MemoryDocumentStore::with_records(&[]);
        store.fail_create_for("Broken").await;
        let entities = ["Fresh One", "Broken", "Fresh Two"]
            .iter()
            .enumerate()
            .map(|(i, title)| SourceEntity {
                title: title.to_string(),
                id: i as i64,
                kind: EntityKind::Channel,
                username: None,
                member_count: None,
                description: None,
            })
            .collect::<Vec<_>>();

        let outcome = add_records(&store, &entities, &no_delay()).await;
        assert_eq!(outcome, BatchOutcome { succeeded: 2, failed: 1 });
        assert_eq!(outcome.total(), 3);
        assert_eq!(store.active_count().await, 2);
    }
}
