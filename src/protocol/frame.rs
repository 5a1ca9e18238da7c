//! RESP values as seen on a client connection
//!
//! Outgoing commands are always arrays of bulk strings. Replies may be any
//! RESP2 type; the RESP3 `_` null is accepted too because some proxies emit
//! it even on RESP2 connections.

use std::fmt;

use bytes::Bytes;

/// One RESP value
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `+OK`
    Simple(Bytes),
    /// `-ERR ...`, first word is the error code
    Error(Bytes),
    /// `:42`
    Integer(i64),
    /// `$n` payload, `None` for `$-1`
    Bulk(Option<Bytes>),
    /// `*n` items, `None` for `*-1`
    Array(Option<Vec<Frame>>),
    /// `_`
    Null,
}

impl Frame {
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Self::Simple(s.into())
    }

    #[cold]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Self::Error(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(Some(data.into()))
    }

    /// `$-1`
    pub fn null() -> Self {
        Self::Bulk(None)
    }

    pub fn array(items: Vec<Frame>) -> Self {
        Self::Array(Some(items))
    }

    /// Payload of any string-like reply, errors included.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Simple(raw) | Self::Error(raw) | Self::Bulk(Some(raw)) => Some(raw),
            _ => None,
        }
    }

    /// Items of a non-nil array.
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Self::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Payload of a non-nil bulk string.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Bulk(Some(raw)) => Some(raw),
            _ => None,
        }
    }

    /// First word of an error reply, e.g. `BUSYKEY` for
    /// `-BUSYKEY Target key name already exists.`
    pub fn error_code(&self) -> Option<&str> {
        let Self::Error(raw) = self else {
            return None;
        };
        std::str::from_utf8(raw).ok()?.split_whitespace().next()
    }

    /// One-line rendering for logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Simple(raw) => format!("+{}", String::from_utf8_lossy(raw)),
            Self::Error(raw) => format!("-{}", String::from_utf8_lossy(raw)),
            Self::Integer(n) => format!(":{n}"),
            Self::Bulk(Some(raw)) => format!("${}", String::from_utf8_lossy(raw)),
            Self::Array(Some(items)) => format!("array({})", items.len()),
            Self::Bulk(None) | Self::Array(None) | Self::Null => "(nil)".to_owned(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
