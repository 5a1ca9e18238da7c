//! Redis-protocol store handles
//!
//! The source side issues `SCAN` and `MIGRATE ... COPY`; the target side
//! issues `EXISTS`. `REPLACE` is only sent when a request asks for it, and
//! the engine never does.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{Cursor, ScanPage, SourceStore, TargetStore, TransferAck, TransferRequest};
use crate::client::{ConnectOptions, Endpoint, RespConnection};
use crate::error::{ClientError, StoreError};
use crate::protocol::Frame;

/// A fixed set of connections to one server.
///
/// Each command checks out one connection for its whole round trip, so
/// concurrent callers never interleave on a socket.
pub struct ConnectionPool {
    endpoint: Endpoint,
    connections: Vec<Mutex<RespConnection>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Open `size` connections (at least one) and verify each with PING.
    pub async fn open(options: ConnectOptions, size: usize) -> Result<Self, StoreError> {
        let endpoint = options.endpoint.clone();
        let mut connections = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let mut conn = RespConnection::open(options.clone())
                .await
                .map_err(|e| setup_error(&endpoint, e))?;
            conn.ping().await.map_err(|e| setup_error(&endpoint, e))?;
            connections.push(Mutex::new(conn));
        }
        debug!(%endpoint, connections = connections.len(), "connection pool ready");
        Ok(Self {
            endpoint,
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Server address
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run one command on a free connection.
    pub async fn command<A: AsRef<[u8]> + Sync>(
        &self,
        name: &'static str,
        args: &[A],
    ) -> Result<Frame, StoreError> {
        let mut conn = self.checkout().await;
        conn.command(args)
            .await
            .map_err(|e| StoreError::command(name, e))
    }

    async fn checkout(&self) -> MutexGuard<'_, RespConnection> {
        let len = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            if let Ok(guard) = self.connections[(start + i) % len].try_lock() {
                return guard;
            }
        }
        self.connections[start % len].lock().await
    }
}

fn setup_error(endpoint: &Endpoint, error: ClientError) -> StoreError {
    match error {
        ClientError::Auth(message) => StoreError::Auth {
            endpoint: endpoint.to_string(),
            message,
        },
        source => StoreError::Connect {
            endpoint: endpoint.to_string(),
            source,
        },
    }
}

fn server_error(name: &'static str, message: &Bytes) -> StoreError {
    StoreError::command(
        name,
        ClientError::Server(String::from_utf8_lossy(message).into_owned()),
    )
}

fn unexpected(name: &'static str, reply: &Frame) -> StoreError {
    StoreError::command(
        name,
        ClientError::UnexpectedReply {
            command: name,
            reply: reply.describe(),
        },
    )
}

/// Source store reached over RESP.
#[derive(Debug)]
pub struct RedisSource {
    pool: ConnectionPool,
}

impl RedisSource {
    /// Connect to the source with `pool_size` connections.
    pub async fn connect(options: ConnectOptions, pool_size: usize) -> Result<Self, StoreError> {
        let db = options.db;
        let pool = ConnectionPool::open(options, pool_size).await?;
        info!(endpoint = %pool.endpoint(), db, "source store connected");
        Ok(Self { pool })
    }

    /// Server address
    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }
}

#[async_trait]
impl SourceStore for RedisSource {
    async fn scan(
        &self,
        cursor: &Cursor,
        count: usize,
        pattern: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        let count = count.to_string();
        let mut args: Vec<&[u8]> = vec![
            &b"SCAN"[..],
            cursor.as_bytes(),
            &b"COUNT"[..],
            count.as_bytes(),
        ];
        if let Some(pattern) = pattern {
            args.push(&b"MATCH"[..]);
            args.push(pattern.as_bytes());
        }

        let reply = self.pool.command("SCAN", &args).await?;
        parse_scan_reply(reply)
    }

    async fn transfer(
        &self,
        key: &[u8],
        request: &TransferRequest,
    ) -> Result<TransferAck, StoreError> {
        let args = migrate_args(key, request);
        let reply = self.pool.command("MIGRATE", &args).await?;
        ack_from_reply(reply)
    }
}

/// Build `MIGRATE host port key db timeout [COPY] [REPLACE] [AUTH ...]`.
fn migrate_args(key: &[u8], request: &TransferRequest) -> Vec<Bytes> {
    let dest = &request.destination;
    let mut args = vec![
        Bytes::from_static(b"MIGRATE"),
        Bytes::from(dest.endpoint.host.clone()),
        Bytes::from(dest.endpoint.port.to_string()),
        Bytes::copy_from_slice(key),
        Bytes::from(dest.db.to_string()),
        Bytes::from(request.timeout.as_millis().to_string()),
    ];
    if request.retain_source {
        args.push(Bytes::from_static(b"COPY"));
    }
    if request.replace_existing {
        args.push(Bytes::from_static(b"REPLACE"));
    }
    if let Some(auth) = &dest.auth {
        match &auth.username {
            Some(user) => {
                args.push(Bytes::from_static(b"AUTH2"));
                args.push(Bytes::from(user.clone()));
                args.push(Bytes::from(auth.password.clone()));
            }
            None => {
                args.push(Bytes::from_static(b"AUTH"));
                args.push(Bytes::from(auth.password.clone()));
            }
        }
    }
    args
}

/// Map a MIGRATE reply onto a [`TransferAck`].
///
/// `IOERR` means the source could not finish talking to the target (this
/// includes its own timeout) and is a transfer failure. Every other error
/// reply, such as `BUSYKEY`, is a refusal. Anything that is not `+OK` and
/// not an error is a non-acknowledgement.
fn ack_from_reply(reply: Frame) -> Result<TransferAck, StoreError> {
    match reply {
        Frame::Simple(ref s) if s.as_ref() == b"OK" => Ok(TransferAck::Ok),
        Frame::Error(ref message) if reply.error_code() == Some("IOERR") => {
            Err(server_error("MIGRATE", message))
        }
        Frame::Error(ref message) => Ok(TransferAck::Refused {
            code: reply.error_code().unwrap_or("ERR").to_string(),
            message: String::from_utf8_lossy(message).into_owned(),
        }),
        Frame::Simple(ref s) => Ok(TransferAck::NotAcknowledged(
            String::from_utf8_lossy(s).into_owned(),
        )),
        other => Ok(TransferAck::NotAcknowledged(other.describe())),
    }
}

fn parse_scan_reply(reply: Frame) -> Result<ScanPage, StoreError> {
    if let Frame::Error(ref message) = reply {
        return Err(server_error("SCAN", message));
    }
    let malformed = unexpected("SCAN", &reply);

    let Some(mut parts) = reply.into_array() else {
        return Err(malformed);
    };
    if parts.len() != 2 {
        return Err(malformed);
    }
    let keys = parts.pop().and_then(Frame::into_array);
    let cursor = parts.pop().and_then(|f| match f {
        Frame::Bulk(Some(b)) | Frame::Simple(b) => Some(b),
        _ => None,
    });
    let (Some(cursor), Some(keys)) = (cursor, keys) else {
        return Err(malformed);
    };

    let keys = keys
        .into_iter()
        .map(|f| f.into_bytes())
        .collect::<Option<Vec<_>>>()
        .ok_or(malformed)?;

    Ok(ScanPage {
        cursor: Cursor::from_token(cursor),
        keys,
    })
}

/// Target store reached over RESP.
#[derive(Debug)]
pub struct RedisTarget {
    pool: ConnectionPool,
}

impl RedisTarget {
    /// Connect to the target with `pool_size` connections.
    pub async fn connect(options: ConnectOptions, pool_size: usize) -> Result<Self, StoreError> {
        let db = options.db;
        let pool = ConnectionPool::open(options, pool_size).await?;
        info!(endpoint = %pool.endpoint(), db, "target store connected");
        Ok(Self { pool })
    }

    /// Server address
    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }
}

#[async_trait]
impl TargetStore for RedisTarget {
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        let args: [&[u8]; 2] = [b"EXISTS", key];
        match self.pool.command("EXISTS", &args).await? {
            Frame::Integer(n) => Ok(n > 0),
            Frame::Error(ref message) => Err(server_error("EXISTS", message)),
            other => Err(unexpected("EXISTS", &other)),
        }
    }
}
