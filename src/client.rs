//! RESP connection to a Redis-protocol server
//!
//! One [`RespConnection`] is one TCP socket issuing one command at a time.
//! Every connect and every command is bounded by a timeout. A connection
//! whose last command failed mid-flight is marked broken and transparently
//! re-established (including AUTH and SELECT) before the next command, so a
//! late reply can never be mistaken for the answer to a later command.

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::protocol::{encode_command, parse_frame_with_limits, Frame, ParserLimits};

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Network address of a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything needed to open (and re-open) a connection.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Server address
    pub endpoint: Endpoint,
    /// ACL username (AUTH2 style), if any
    pub username: Option<String>,
    /// Password for AUTH, if any
    pub password: Option<String>,
    /// Logical database selected after connecting
    pub db: u32,
    /// Bound on TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on each command round trip
    pub call_timeout: Duration,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("connect_timeout", &self.connect_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ConnectOptions {
    /// Options for an unauthenticated connection to DB 0.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            username: None,
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// A single RESP client connection.
pub struct RespConnection {
    options: ConnectOptions,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    limits: ParserLimits,
}

impl fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespConnection")
            .field("endpoint", &self.options.endpoint)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl RespConnection {
    /// Connect, authenticate and select the configured database.
    pub async fn open(options: ConnectOptions) -> Result<Self> {
        let mut conn = Self {
            options,
            stream: None,
            buffer: BytesMut::with_capacity(16 * 1024),
            limits: ParserLimits::default(),
        };
        conn.establish().await?;
        Ok(conn)
    }

    /// The address this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.options.endpoint
    }

    /// Whether the socket is currently usable without reconnecting.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send a command and wait for its reply.
    ///
    /// Error replies are returned as `Ok(Frame::Error(..))`; callers decide
    /// what a server-side error means for their command.
    pub async fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame> {
        if self.stream.is_none() {
            debug!(endpoint = %self.options.endpoint, "re-establishing broken connection");
            self.establish().await?;
        }
        let deadline = self.options.call_timeout;
        match timeout(deadline, self.round_trip(args)).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => {
                self.mark_broken();
                Err(e)
            }
            Err(_) => {
                self.mark_broken();
                Err(ClientError::Timeout(deadline))
            }
        }
    }

    /// PING the server, expecting PONG.
    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.command(&["PING"]).await?;
        match reply {
            Frame::Simple(ref s) if s.as_ref() == b"PONG" => Ok(()),
            Frame::Error(msg) => Err(ClientError::Server(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Err(ClientError::UnexpectedReply {
                command: "PING",
                reply: other.describe(),
            }),
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let connect_timeout = self.options.connect_timeout;
        let addr = self.options.endpoint.to_string();

        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.buffer.clear();

        let outcome = match timeout(connect_timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(connect_timeout)),
        };
        if let Err(e) = outcome {
            self.mark_broken();
            return Err(e);
        }

        debug!(endpoint = %self.options.endpoint, db = self.options.db, "connection established");
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        if let Some(password) = self.options.password.clone() {
            let username = self.options.username.clone();
            self.handshake_auth(username.as_deref(), &password).await?;
        }
        if self.options.db != 0 {
            let db = self.options.db.to_string();
            self.expect_ok("SELECT", &["SELECT", db.as_str()]).await?;
        }
        Ok(())
    }

    async fn handshake_auth(&mut self, username: Option<&str>, password: &str) -> Result<()> {
        let reply = match username {
            Some(user) => self.round_trip(&["AUTH", user, password]).await?,
            None => self.round_trip(&["AUTH", password]).await?,
        };
        match reply {
            Frame::Simple(_) => Ok(()),
            Frame::Error(msg) => Err(ClientError::Auth(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Err(ClientError::UnexpectedReply {
                command: "AUTH",
                reply: other.describe(),
            }),
        }
    }

    async fn expect_ok(&mut self, command: &'static str, args: &[&str]) -> Result<()> {
        match self.round_trip(args).await? {
            Frame::Simple(ref s) if s.as_ref() == b"OK" => Ok(()),
            Frame::Error(msg) => Err(ClientError::Server(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Err(ClientError::UnexpectedReply {
                command,
                reply: other.describe(),
            }),
        }
    }

    async fn round_trip<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Frame> {
        let mut out = BytesMut::new();
        encode_command(args, &mut out);

        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;
        stream.write_all(&out).await?;
        stream.flush().await?;

        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = parse_frame_with_limits(&mut self.buffer, &self.limits)? {
                return Ok(frame);
            }
            let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;
            if stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    fn mark_broken(&mut self) {
        if self.stream.take().is_some() {
            warn!(endpoint = %self.options.endpoint, "connection marked broken");
        }
        self.buffer.clear();
    }
}
