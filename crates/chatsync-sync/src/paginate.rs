//! Cursor-driven retrieval of every record in the document store.

use anyhow::{bail, Context, Result};
use chatsync_adapters::{parse_record, DocumentStore};
use chatsync_core::Record;
use chatsync_storage::MAX_PAGE_SIZE;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationStats {
    pub pages: usize,
    pub records: usize,
    pub skipped: usize,
}

pub struct Paginator<'a, S: DocumentStore + ?Sized> {
    store: &'a S,
    page_size: usize,
}

impl<'a, S: DocumentStore + ?Sized> Paginator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub async fn fetch_all(&self) -> Result<Vec<Record>> {
        let (records, _stats) = self.fetch_all_with_stats().await?;
        Ok(records)
    }

    /// Walk every page in arrival order. Unparseable entries are skipped; a
    /// failed page request aborts the whole fetch.
    pub async fn fetch_all_with_stats(&self) -> Result<(Vec<Record>, PaginationStats)> {
        let schema = self.store.schema();
        let mut records = Vec::new();
        let mut stats = PaginationStats::default();
        let mut cursor: Option<String> = None;

        loop {
            let batch = self
                .store
                .query_page(cursor.as_deref(), self.page_size)
                .await
                .with_context(|| format!("querying store page {}", stats.pages + 1))?;
            stats.pages += 1;

            for (index, raw) in batch.records.iter().enumerate() {
                match parse_record(raw, schema) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        stats.skipped += 1;
                        warn!(page = stats.pages, index, error = %err, "skipping malformed record");
                    }
                }
            }
            info!(page = stats.pages, total = records.len(), "fetched store page");

            if !batch.has_more {
                break;
            }
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => bail!(
                    "store reported more pages after page {} but returned no cursor",
                    stats.pages
                ),
            }
        }

        stats.records = records.len();
        Ok((records, stats))
    }
}
