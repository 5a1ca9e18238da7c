//! Keyspace enumeration
//!
//! Pages through the source with a cursor instead of taking a snapshot.
//! The sweep ends when the store hands back the terminal cursor, never
//! because a page came back empty.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{MigrateError, Result};
use crate::store::{Cursor, SourceStore};

/// Cursor-driven iterator over batches of source keys.
pub struct KeyspaceEnumerator {
    source: Arc<dyn SourceStore>,
    cursor: Cursor,
    chunk_size: usize,
    pattern: Option<String>,
    finished: bool,
    pages: u64,
}

impl KeyspaceEnumerator {
    /// Start a sweep from the beginning of the keyspace.
    pub fn new(source: Arc<dyn SourceStore>, chunk_size: usize, pattern: Option<String>) -> Self {
        Self {
            source,
            cursor: Cursor::start(),
            chunk_size: chunk_size.max(1),
            pattern,
            finished: false,
            pages: 0,
        }
    }

    /// Fetch the next batch.
    ///
    /// Returns `Ok(None)` once the page carrying the terminal cursor has
    /// been handed out. A returned batch may be empty. Any store failure is
    /// an enumeration error; the sweep cannot continue after one.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Bytes>>> {
        if self.finished {
            return Ok(None);
        }

        let page = self
            .source
            .scan(&self.cursor, self.chunk_size, self.pattern.as_deref())
            .await
            .map_err(|source| {
                self.finished = true;
                MigrateError::Enumeration {
                    cursor: self.cursor.to_string(),
                    source,
                }
            })?;

        self.pages += 1;
        trace!(
            cursor = %self.cursor,
            next = %page.cursor,
            keys = page.keys.len(),
            "scanned page"
        );

        if page.cursor.is_terminal() {
            debug!(pages = self.pages, "keyspace sweep complete");
            self.finished = true;
        }
        self.cursor = page.cursor;
        Ok(Some(page.keys))
    }

    /// Pages fetched so far
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Current cursor
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }
}
