//! Store handles consumed by the migration engine
//!
//! The engine never talks to sockets directly. It sees a [`SourceStore`]
//! that can page through its keyspace and push a key to a remote location,
//! and a [`TargetStore`] that can answer whether a key exists.
//!
//! - [`RedisSource`] / [`RedisTarget`] implement them over RESP connections.
//! - [`MemoryStore`] implements both in process, for tests and rehearsals.

pub mod memory;
pub mod redis;

pub use memory::{MemoryNetwork, MemoryStore};
pub use redis::{ConnectionPool, RedisSource, RedisTarget};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::Endpoint;
use crate::error::StoreError;

/// Opaque position in the source keyspace.
///
/// Enumeration starts at [`Cursor::start`] and is complete once the store
/// hands back a terminal cursor. For Redis both are `"0"`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Bytes);

impl Cursor {
    const ZERO: &'static [u8] = b"0";

    /// Start-of-keyspace cursor
    pub fn start() -> Self {
        Cursor(Bytes::from_static(Self::ZERO))
    }

    /// Wrap a cursor token returned by a store
    pub fn from_token(token: impl Into<Bytes>) -> Self {
        Cursor(token.into())
    }

    /// Whether this cursor marks a completed sweep
    pub fn is_terminal(&self) -> bool {
        self.0.as_ref() == Self::ZERO
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self)
    }
}

/// One page of a keyspace sweep.
#[derive(Debug, Clone)]
pub struct ScanPage {
    /// Cursor to pass to the next call
    pub cursor: Cursor,
    /// Keys in this page; may be empty even when the sweep is not done
    pub keys: Vec<Bytes>,
}

/// Credentials the source presents to the target during a transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferAuth {
    /// ACL username, if any
    pub username: Option<String>,
    /// Password
    pub password: String,
}

impl fmt::Debug for TransferAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where migrated keys land.
///
/// Used both to reach the target for existence checks and as the
/// destination argument of the transfer primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Target address
    pub endpoint: Endpoint,
    /// Target logical database
    pub db: u32,
    /// Credentials forwarded with the transfer
    pub auth: Option<TransferAuth>,
}

impl Location {
    /// A location without credentials
    pub fn new(endpoint: Endpoint, db: u32) -> Self {
        Self {
            endpoint,
            db,
            auth: None,
        }
    }

    /// Build the transfer request used for every key of a run: copy
    /// semantics, never replace, bounded by `timeout`.
    pub fn transfer_request(&self, timeout: Duration) -> TransferRequest {
        TransferRequest {
            destination: self.clone(),
            timeout,
            retain_source: true,
            replace_existing: false,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.db)
    }
}

/// Parameters of one key transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Destination store
    pub destination: Location,
    /// Bound the source applies to its own transfer I/O
    pub timeout: Duration,
    /// Keep the key on the source (COPY)
    pub retain_source: bool,
    /// Overwrite an existing destination value (REPLACE)
    pub replace_existing: bool,
}

/// Acknowledgement returned by the source for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAck {
    /// The key was copied
    Ok,
    /// The source answered with something other than success, e.g. the key
    /// no longer exists on the source
    NotAcknowledged(String),
    /// The transfer was refused, e.g. the target already holds the key
    Refused {
        /// Error code such as `BUSYKEY`
        code: String,
        /// Full server message
        message: String,
    },
}

/// The side keys are read from.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch the page following `cursor`. `count` is a size hint.
    async fn scan(
        &self,
        cursor: &Cursor,
        count: usize,
        pattern: Option<&str>,
    ) -> Result<ScanPage, StoreError>;

    /// Push `key` to `request.destination`.
    async fn transfer(&self, key: &[u8], request: &TransferRequest)
        -> Result<TransferAck, StoreError>;
}

/// The side keys are written to.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Whether `key` (byte-exact) currently exists.
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError>;
}

/// Render an opaque key for humans: lossy UTF-8 with control bytes escaped.
pub fn display_key(key: &[u8]) -> String {
    let text = String::from_utf8_lossy(key);
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_control() {
            out.extend(ch.escape_default());
        } else {
            out.push(ch);
        }
    }
    out
}
