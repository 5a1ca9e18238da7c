//! In-process store
//!
//! [`MemoryStore`] implements both store traits over a sorted map so the
//! engine can be exercised without a network. Stores live on a
//! [`MemoryNetwork`], addressed by endpoint and DB, which is how a transfer
//! finds its destination. Transfers follow MIGRATE semantics: a missing
//! source key answers `NOKEY`, an existing destination key without REPLACE
//! is refused with `BUSYKEY`, and COPY keeps the source key.
//!
//! [`MemoryFaults`] injects the failure modes a real deployment shows:
//! failing transfers, failing existence checks, empty pages mid-sweep,
//! pages that repeat keys, a sweep that breaks after N pages, and a writer
//! that races a transfer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{Cursor, ScanPage, SourceStore, TargetStore, TransferAck, TransferRequest};
use crate::client::Endpoint;
use crate::error::{ClientError, StoreError};

/// A set of in-process stores addressed like real servers.
#[derive(Default)]
pub struct MemoryNetwork {
    stores: RwLock<HashMap<(Endpoint, u32), Arc<MemoryStore>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the store at `endpoint` / `db`.
    ///
    /// Stores point back at the network weakly; transfers only resolve
    /// their destination while the network is alive.
    pub fn store(self: &Arc<Self>, endpoint: &Endpoint, db: u32) -> Arc<MemoryStore> {
        let key = (endpoint.clone(), db);
        if let Some(store) = self.stores.read().get(&key) {
            return Arc::clone(store);
        }
        let mut stores = self.stores.write();
        Arc::clone(stores.entry(key).or_insert_with(|| {
            Arc::new(MemoryStore::with_network(Arc::downgrade(self)))
        }))
    }

    fn lookup(&self, endpoint: &Endpoint, db: u32) -> Option<Arc<MemoryStore>> {
        self.stores.read().get(&(endpoint.clone(), db)).cloned()
    }
}

/// Injected failure modes.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    /// Transfers of these keys time out
    pub failing_transfers: HashSet<Bytes>,
    /// Existence checks of these keys fail
    pub failing_checks: HashSet<Bytes>,
    /// Another writer creates these keys on the destination just before
    /// the transfer lands
    pub racing_writes: HashSet<Bytes>,
    /// Number of empty, non-terminal pages returned before real pages
    pub empty_pages: usize,
    /// Each page also carries the previous page's keys
    pub repeat_previous_page: bool,
    /// SCAN fails once this many pages have been served
    pub fail_scan_after: Option<usize>,
}

/// Call counters, for asserting on side effects.
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// SCAN calls served
    pub scans: AtomicU64,
    /// EXISTS calls served
    pub exists_checks: AtomicU64,
    /// Transfers attempted
    pub transfers: AtomicU64,
}

/// A sorted in-memory keyspace.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    faults: RwLock<MemoryFaults>,
    network: Weak<MemoryNetwork>,
    stats: MemoryStats,
}

impl MemoryStore {
    /// A store that is not attached to any network; transfers from it fail.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_network(network: Weak<MemoryNetwork>) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Write a key
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Read a key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    /// Remove a key
    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        self.data.write().remove(key)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the whole keyspace
    pub fn snapshot(&self) -> BTreeMap<Bytes, Bytes> {
        self.data.read().clone()
    }

    /// Replace the injected faults
    pub fn set_faults(&self, faults: MemoryFaults) {
        *self.faults.write() = faults;
    }

    /// Call counters
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    fn page(&self, start: usize, count: usize) -> (Vec<Bytes>, Option<usize>) {
        let data = self.data.read();
        let keys: Vec<Bytes> = data.keys().skip(start).take(count).cloned().collect();
        let next = start + keys.len();
        let more = next < data.len();
        (keys, more.then_some(next))
    }
}

/// Cursor layout: `"<position>"` for real pages, `"e<n>"` while injected
/// empty pages are still being served.
fn decode_cursor(cursor: &Cursor) -> Result<(usize, usize), StoreError> {
    let text = std::str::from_utf8(cursor.as_bytes()).unwrap_or_default();
    let parsed = match text.strip_prefix('e') {
        Some(n) => n.parse().map(|n| (n, 0)),
        None => text.parse().map(|pos| (usize::MAX, pos)),
    };
    parsed.map_err(|_| {
        StoreError::command("SCAN", ClientError::Server("ERR invalid cursor".to_string()))
    })
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn scan(
        &self,
        cursor: &Cursor,
        count: usize,
        pattern: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        let served = self.stats.scans.fetch_add(1, Ordering::SeqCst) as usize;
        let faults = self.faults.read().clone();

        if let Some(limit) = faults.fail_scan_after {
            if served >= limit {
                return Err(StoreError::command(
                    "SCAN",
                    ClientError::ConnectionClosed,
                ));
            }
        }

        let (empties_served, position) = decode_cursor(cursor)?;
        let empties_served = if cursor.is_terminal() { 0 } else { empties_served };
        if empties_served < faults.empty_pages {
            return Ok(ScanPage {
                cursor: Cursor::from_token(format!("e{}", empties_served + 1)),
                keys: Vec::new(),
            });
        }

        let count = count.max(1);
        let (mut keys, next) = self.page(position, count);
        if faults.repeat_previous_page && position > 0 {
            let (previous, _) = self.page(position.saturating_sub(count), count);
            keys.extend(previous);
        }
        if let Some(pattern) = pattern {
            keys.retain(|k| glob_match(pattern.as_bytes(), k));
        }

        let cursor = match next {
            Some(next) => Cursor::from_token(next.to_string()),
            None => Cursor::start(),
        };
        Ok(ScanPage { cursor, keys })
    }

    async fn transfer(
        &self,
        key: &[u8],
        request: &TransferRequest,
    ) -> Result<TransferAck, StoreError> {
        self.stats.transfers.fetch_add(1, Ordering::SeqCst);
        let faults = self.faults.read().clone();

        if faults.failing_transfers.contains(key) {
            return Err(StoreError::command(
                "MIGRATE",
                ClientError::Timeout(request.timeout),
            ));
        }

        let destination = self
            .network
            .upgrade()
            .and_then(|net| net.lookup(&request.destination.endpoint, request.destination.db))
            .ok_or_else(|| {
                StoreError::command(
                    "MIGRATE",
                    ClientError::Server(format!(
                        "IOERR error or timeout connecting to the client: {}",
                        request.destination
                    )),
                )
            })?;

        let Some(value) = self.get(key) else {
            return Ok(TransferAck::NotAcknowledged("NOKEY".to_string()));
        };

        if faults.racing_writes.contains(key) {
            destination.set(Bytes::copy_from_slice(key), Bytes::from_static(b"racer"));
        }

        {
            let mut dest = destination.data.write();
            if dest.contains_key(key) && !request.replace_existing {
                return Ok(TransferAck::Refused {
                    code: "BUSYKEY".to_string(),
                    message: "BUSYKEY Target key name already exists.".to_string(),
                });
            }
            dest.insert(Bytes::copy_from_slice(key), value);
        }

        if !request.retain_source {
            self.remove(key);
        }
        Ok(TransferAck::Ok)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.stats.exists_checks.fetch_add(1, Ordering::SeqCst);
        if self.faults.read().failing_checks.contains(key) {
            return Err(StoreError::command(
                "EXISTS",
                ClientError::Timeout(Duration::from_millis(0)),
            ));
        }
        Ok(self.data.read().contains_key(key))
    }
}

/// Redis-style glob matching supporting `*`, `?` and `[...]` classes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(b'['), Some(&c)) => match pattern.iter().position(|&b| b == b']') {
            Some(end) => {
                let class = &pattern[1..end];
                let (negate, class) = match class.first() {
                    Some(b'^') => (true, &class[1..]),
                    _ => (false, class),
                };
                (class.contains(&c) != negate) && glob_match(&pattern[end + 1..], &text[1..])
            }
            None => c == b'[' && glob_match(&pattern[1..], &text[1..]),
        },
        (Some(b'\\'), Some(&c)) if pattern.len() > 1 => {
            pattern[1] == c && glob_match(&pattern[2..], &text[1..])
        }
        (Some(&p), Some(&c)) => p == c && glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
