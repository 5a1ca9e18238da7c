//! Error types for keyshift
//!
//! Errors are layered: the wire client reports [`ClientError`], the store
//! handles wrap it in [`StoreError`], and a migration run surfaces
//! [`MigrateError`]. Whether an error is fatal depends on where it happens:
//! setup and enumeration errors end the run, per-key errors do not.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ParseError;

/// Errors raised by a single RESP connection.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server replied with bytes that are not valid RESP
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A connect or command did not finish within its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The reply had the wrong shape for the command that was sent
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Command name
        command: &'static str,
        /// Rendered reply
        reply: String,
    },

    /// AUTH was rejected
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The server answered with an error reply
    #[error("server error: {0}")]
    Server(String),
}

/// Errors raised by a store handle.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or verified
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        /// `host:port` of the store
        endpoint: String,
        /// Underlying failure
        #[source]
        source: ClientError,
    },

    /// Credentials were rejected
    #[error("authentication to {endpoint} failed: {message}")]
    Auth {
        /// `host:port` of the store
        endpoint: String,
        /// Server message
        message: String,
    },

    /// A command failed after setup
    #[error("{command} failed: {source}")]
    Command {
        /// Command name
        command: &'static str,
        /// Underlying failure
        #[source]
        source: ClientError,
    },
}

impl StoreError {
    pub(crate) fn command(command: &'static str, source: ClientError) -> Self {
        StoreError::Command { command, source }
    }
}

/// Top-level error for a migration run.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A store handle could not be established
    #[error("{role} store setup failed: {source}")]
    Setup {
        /// "source" or "target"
        role: &'static str,
        /// Underlying failure
        #[source]
        source: StoreError,
    },

    /// Paging through the source keyspace failed mid-run
    #[error("keyspace enumeration failed at cursor {cursor}: {source}")]
    Enumeration {
        /// Cursor that was being fetched
        cursor: String,
        /// Underlying failure
        #[source]
        source: StoreError,
    },

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrateError>;
