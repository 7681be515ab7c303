#![deny(missing_docs)]
//! # kvpipe
//! A pipelining client for key-value servers speaking the RESP wire
//! protocol, with cluster-aware routing and cold-key archival.
//!
//! Commands issued inside a session are collected and flushed as one
//! pipeline; replies come back in program order, with per-request parsers
//! applied before they surface:
//!
//! ```no_run
//! use kvpipe::{Client, Value};
//!
//! # fn main() -> kvpipe::Result<()> {
//! let client = Client::connect("127.0.0.1:6379")?;
//! let replies = client.pipeline(|s| {
//!     s.ping()?;
//!     s.set("greeting", Value::from("hello"))?;
//!     s.get("greeting")
//! })?;
//! assert_eq!(replies.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! Values richer than text ride the wire behind in-bulk type markers, so
//! byte buffers and serialized application objects round-trip with their
//! kind intact. Against a cluster, flushed pipelines are partitioned by
//! keyslot, dispatched to their owning nodes in parallel, and transparently
//! retried through `MOVED`/`ASK` redirects. The [`tundra`] module layers a
//! cold-key archival protocol over the server's DUMP/RESTORE primitives.

mod cluster;
mod commands;
mod error;
mod executor;
mod freeze;
mod pool;
mod reply;
mod request;
mod resp;
mod session;
mod value;

pub mod thread_pool;
pub mod tundra;

pub use cluster::{key_slot, KeyslotCache, KEYSLOTS};
pub use error::{PipeError, Result};
pub use freeze::{Freezer, JsonFreezer, ThawOpts};
pub use pool::{ConnectionPool, NodeSpec, PoolSettings, PooledConnection};
pub use reply::{Bulk, Reply, ServerError};
pub use request::{Parser, ParserFn, ParserOpts};
pub use session::{Client, ClientConfig, Replies, Session};
pub use value::Value;
