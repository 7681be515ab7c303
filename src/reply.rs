//! Typed reply model for the RESP wire protocol.

use std::fmt;

/// One decoded server reply.
///
/// Errors are first-class values here: a command that failed inside a
/// pipeline yields `Reply::Error` in its slot rather than aborting the whole
/// batch. Only the single-reply unwrap boundary raises them.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK` style simple strings
    Simple(String),
    /// `:123` signed 64-bit integers
    Int(i64),
    /// `-ERR ...` error replies
    Error(ServerError),
    /// `$...` bulk payloads, decoded per the in-bulk type markers
    Bulk(Bulk),
    /// `*...` arrays; `None` is the null array
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// returns true when this reply is a server error
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// borrows the bulk payload, if this reply is one
    pub fn as_bulk(&self) -> Option<&Bulk> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }
}

/// The payload of a bulk reply after the tunneled type markers are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Bulk {
    /// the null bulk (`$-1`); a missing key
    Nil,
    /// an unmarked payload that decoded as UTF-8
    Text(String),
    /// raw bytes, either marker-tunneled binary or undecodable text
    Bytes(Vec<u8>),
    /// a frozen application object, thawed by the configured freezer
    Object(serde_json::Value),
}

/// An error reply, classified by its leading token.
///
/// `prefix` is the first whitespace-delimited token of the error line,
/// lowercased. The cluster dispatcher routes on it (`moved`, `ask`); callers
/// typically match on `wrongtype`, `err` and friends. Client-synthesized
/// errors use the reserved prefixes `timeout` and `thaw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// lowercased first token of the error line
    pub prefix: String,
    /// the full error line as sent by the server
    pub message: String,
}

impl ServerError {
    /// builds an error from one `-` reply line
    pub(crate) fn from_line(line: &str) -> Self {
        let prefix = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        ServerError {
            prefix,
            message: line.to_string(),
        }
    }

    /// builds a client-synthesized error with the given prefix
    pub(crate) fn synthesized(prefix: &str, message: impl Into<String>) -> Self {
        ServerError {
            prefix: prefix.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServerError {}
