use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

use crate::reply::ServerError;

/// type alias for all operations in this crate that could fail with a [`PipeError`]
pub type Result<T> = std::result::Result<T, PipeError>;

/// Error variants surfaced by the client.
///
/// Server errors that appear *inside* a pipeline are ordinary reply values and
/// never take this form; only the single-reply unwrap boundary promotes them
/// to [`PipeError::Reply`].
#[derive(Error)]
pub enum PipeError {
    /// variant for errors caused by std::io while talking to a server
    #[error("IO error")]
    Io {
        /// source of the IO error
        #[from]
        source: io::Error,
    },

    /// variant for malformed wire data; the connection that produced it is poisoned
    #[error("protocol error: {}", .0)]
    Protocol(String),

    /// variant for a server error reply unwrapped at the single-reply boundary
    #[error("server error: {}", .source)]
    Reply {
        /// the error reply as returned by the server
        #[from]
        source: ServerError,
    },

    /// variant for arguments that cannot be encoded for the wire
    #[error("{}", .0)]
    Coerce(String),

    /// variant for errors caused during value serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for an exhausted connection pool
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// variant for a poisoned lock around shared client state
    #[error("{}", .0)]
    Locking(String),

    /// variant for invalid client or store configuration
    #[error("{}", .0)]
    Config(String),

    /// variant for keys that were absent when marking them dirty
    #[error("keys missing on server: {:?}", .0)]
    MissingKeys(Vec<String>),

    /// variant aggregating per-key failures from an ensure pass
    #[error("could not restore all keys: {:?}", .0)]
    Ensure(BTreeMap<String, String>),

    /// variant for external datastore failures
    #[error("datastore error: {}", .0)]
    Datastore(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
