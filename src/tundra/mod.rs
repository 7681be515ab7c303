//! Cold-key archival: mirror key values to an external datastore and
//! restore them on demand.
//!
//! The server stays the system of record for hot data; this module layers
//! an at-least-once durability protocol over its DUMP/RESTORE primitives.
//! [`TundraStore::ensure_keys`] restores any missing keys from the
//! datastore before they are used; [`TundraStore::dirty`] marks changed
//! keys for asynchronous archival; the [`worker`](TundraStore::worker)
//! drains the mark queue, dumping each key and writing it out.

mod support;
mod worker;

pub use support::{MemoryDataStore, MemoryQueue};
pub use worker::{Backoff, Monitor, TundraWorker, WorkerEvent, WorkerOpts};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PipeError, Result};
use crate::reply::Reply;
use crate::session::{Client, Replies};

/// queue the dirty-key marks travel on
pub const TUNDRA_QUEUE: &str = "kvpipe.tundra";

/// safety floor for [`TundraStore`]'s optional server-side TTL
pub const MIN_REDIS_TTL_MS: u64 = 10 * 60 * 60 * 1000;

/// a RESTORE that lost a race to a concurrent restore; treated as success
const RESTORE_BUSY: &str = "ERR Target key name is busy.";

/// Atomic per-key existence probe. With a TTL configured, keys that already
/// carry a finite TTL get it extended in the same pass.
const TOUCH_SCRIPT: &str = "\
local out = {}
local ttl = tonumber(ARGV[1])
for i, k in ipairs(KEYS) do
  if ttl and ttl > 0 and redis.call('pttl', k) > 0 then
    redis.call('pexpire', k, ttl)
    out[i] = 1
  else
    out[i] = redis.call('exists', k)
  end
end
return out";

/// External blob storage the archival protocol writes to and restores from.
pub trait DataStore: Send + Sync {
    /// stores a blob under a key, overwriting any previous blob
    fn put(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// fetches the blob stored under a key
    ///
    /// # Errors
    /// Implementations return [`PipeError::Datastore`] (or any other
    /// variant) when the key has no blob or the backend failed.
    fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// A reliable work queue with idempotent enqueue by message id.
pub trait WorkQueue: Send + Sync {
    /// Enqueues `payload` under `mid`. While a message with the same id is
    /// already pending the call is a no-op; while one is locked (dequeued
    /// but not yet settled), `allow_locked_dupe` decides whether a duplicate
    /// may be queued behind it.
    fn enqueue(&self, queue: &str, payload: &str, mid: &str, allow_locked_dupe: bool)
        -> Result<()>;

    /// takes the next due message, locking it until settled
    fn dequeue(&self, queue: &str) -> Result<Option<QueueMessage>>;

    /// settles a locked message as done
    fn ack(&self, queue: &str, mid: &str) -> Result<()>;

    /// returns a locked message to the queue after a backoff
    fn nack(&self, queue: &str, mid: &str, backoff_ms: u64) -> Result<()>;
}

/// One message taken from a [`WorkQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// the message id it was enqueued under
    pub mid: String,
    /// the message body; for tundra marks, the key name
    pub payload: String,
    /// how many times this message has been dequeued, this take included
    pub attempt: u32,
}

/// Optional transform between DUMP payloads and datastore blobs
/// (compression, encryption, a versioned envelope). Identity when absent.
pub trait BlobCodec: Send + Sync {
    /// encodes a DUMP payload for the datastore
    fn wrap(&self, blob: &[u8]) -> Result<Vec<u8>>;

    /// decodes a datastore blob back into a DUMP payload
    fn unwrap(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// The archival coordinator: a client plus its external collaborators.
pub struct TundraStore {
    pub(crate) client: Client,
    pub(crate) datastore: Arc<dyn DataStore>,
    pub(crate) codec: Option<Arc<dyn BlobCodec>>,
    pub(crate) redis_ttl_ms: Option<u64>,
}

impl std::fmt::Debug for TundraStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TundraStore")
            .field("redis_ttl_ms", &self.redis_ttl_ms)
            .finish()
    }
}

impl TundraStore {
    /// Creates a coordinator.
    ///
    /// # Errors
    /// Returns [`PipeError::Config`] when `redis_ttl_ms` is set below the
    /// [`MIN_REDIS_TTL_MS`] safety floor. The floor guards operators, not
    /// correctness: with a TTL set, keys the worker has not yet archived can
    /// expire, so the window is kept wide.
    pub fn new(
        client: Client,
        datastore: Arc<dyn DataStore>,
        redis_ttl_ms: Option<u64>,
    ) -> Result<TundraStore> {
        if let Some(ttl) = redis_ttl_ms {
            if ttl < MIN_REDIS_TTL_MS {
                return Err(PipeError::Config(format!(
                    "redis_ttl_ms {} is below the {}ms floor",
                    ttl, MIN_REDIS_TTL_MS
                )));
            }
        }
        Ok(TundraStore {
            client,
            datastore,
            codec: None,
            redis_ttl_ms,
        })
    }

    /// installs a blob codec between DUMP payloads and the datastore
    pub fn with_codec(mut self, codec: Arc<dyn BlobCodec>) -> TundraStore {
        self.codec = Some(codec);
        self
    }

    /// Runs the touch script over `keys`, returning one present/absent flag
    /// per key in order.
    fn touch(&self, keys: &[&str]) -> Result<Vec<bool>> {
        let ttl = self.redis_ttl_ms.unwrap_or(0) as i64;
        let reply = self
            .client
            .execute(|s| s.eval(TOUCH_SCRIPT, keys, &[crate::value::Value::from(ttl)]))?;
        let items = match reply {
            Replies::One(Reply::Array(Some(items))) => items,
            other => {
                return Err(PipeError::Protocol(format!(
                    "touch script returned {:?}",
                    other
                )))
            }
        };
        if items.len() != keys.len() {
            return Err(PipeError::Protocol(format!(
                "touch script returned {} flags for {} keys",
                items.len(),
                keys.len()
            )));
        }
        items
            .into_iter()
            .map(|item| match item {
                Reply::Int(n) => Ok(n == 1),
                other => Err(PipeError::Protocol(format!(
                    "touch script flag was {:?}",
                    other
                ))),
            })
            .collect()
    }

    /// Makes sure every key in `keys` exists on the server, restoring
    /// missing ones from the datastore.
    ///
    /// Per-key failures (datastore miss, codec failure, restore error) are
    /// collected rather than short-circuiting, so one bad key cannot block
    /// its batch. Idempotent: a key restored concurrently by another caller
    /// counts as restored here too.
    ///
    /// # Errors
    /// Returns [`PipeError::Ensure`] mapping each failed key to its cause.
    pub fn ensure_keys(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let present = self.touch(keys)?;
        let missing: Vec<&str> = keys
            .iter()
            .zip(&present)
            .filter(|(_, present)| !**present)
            .map(|(key, _)| *key)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        debug!(missing = missing.len(), "restoring evicted keys");

        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        let mut fetched: Vec<(&str, Vec<u8>)> = Vec::new();
        for key in missing {
            match self.fetch_blob(key) {
                Ok(blob) => fetched.push((key, blob)),
                Err(e) => {
                    failures.insert(key.to_string(), e.to_string());
                }
            }
        }

        if !fetched.is_empty() {
            let ttl = self.redis_ttl_ms.unwrap_or(0) as i64;
            let replies = self.client.pipeline(|s| {
                for (key, blob) in &fetched {
                    s.restore(key, ttl, blob.clone())?;
                }
                Ok(())
            })?;
            for ((key, _), reply) in fetched.iter().zip(replies) {
                match reply {
                    Reply::Simple(_) => {}
                    Reply::Error(ref e) if e.message == RESTORE_BUSY => {}
                    Reply::Error(e) => {
                        failures.insert(key.to_string(), e.message);
                    }
                    other => {
                        failures.insert(
                            key.to_string(),
                            format!("unexpected restore reply: {:?}", other),
                        );
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipeError::Ensure(failures))
        }
    }

    /// Marks `keys` for asynchronous archival.
    ///
    /// Every key that exists on the server is enqueued on
    /// [`TUNDRA_QUEUE`] with the key as message id, so repeated marks
    /// coalesce while one is pending.
    ///
    /// # Errors
    /// Returns [`PipeError::MissingKeys`] listing keys absent from the
    /// server. Keys that were present have already been enqueued; marks are
    /// not rolled back.
    pub fn dirty(&self, queue: &dyn WorkQueue, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let present = self.touch(keys)?;
        let mut missing = Vec::new();
        for (key, present) in keys.iter().zip(&present) {
            if *present {
                queue.enqueue(TUNDRA_QUEUE, key, key, true)?;
            } else {
                missing.push(key.to_string());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipeError::MissingKeys(missing))
        }
    }

    fn fetch_blob(&self, key: &str) -> Result<Vec<u8>> {
        let blob = self.datastore.fetch(key)?;
        match &self.codec {
            Some(codec) => codec.unwrap(&blob),
            None => Ok(blob),
        }
    }
}
