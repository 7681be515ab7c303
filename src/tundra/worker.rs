//! The archival worker: a long-running consumer of the tundra mark queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{PipeError, Result};
use crate::reply::{Bulk, Reply};
use crate::session::{Client, Replies};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};

use super::{BlobCodec, DataStore, QueueMessage, TundraStore, WorkQueue, TUNDRA_QUEUE};

/// Delay before a failed message is retried.
#[derive(Clone)]
pub enum Backoff {
    /// a fixed delay in milliseconds
    Constant(u64),
    /// a delay computed from the attempt number (1-based)
    Custom(Arc<dyn Fn(u32) -> u64 + Send + Sync>),
}

impl Backoff {
    fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            Backoff::Constant(ms) => *ms,
            Backoff::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Constant(ms) => write!(f, "Backoff::Constant({})", ms),
            Backoff::Custom(_) => write!(f, "Backoff::Custom(..)"),
        }
    }
}

/// callback invoked with every worker outcome, for operational monitoring
pub type Monitor = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

/// What happened to one dequeued mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// the key was dumped and written to the datastore
    Archived {
        /// the archived key
        key: String,
    },
    /// the key no longer existed on the server; the mark was dropped
    Skipped {
        /// the vanished key
        key: String,
    },
    /// archival failed and the mark was re-queued
    Retried {
        /// the key being archived
        key: String,
        /// the attempt that failed (1-based)
        attempt: u32,
        /// delay before the next attempt
        backoff_ms: u64,
    },
    /// archival failed permanently; the value may be lost if it expires
    Failed {
        /// the key that could not be archived
        key: String,
        /// the final failure
        cause: String,
    },
}

/// Tunables for [`TundraStore::worker`].
#[derive(Clone)]
pub struct WorkerOpts {
    /// consumer threads to run
    pub nthreads: u32,
    /// pause between handled messages, for load shedding
    pub throttle_ms: u64,
    /// pause when the queue is empty
    pub eoq_backoff_ms: u64,
    /// attempts per message before giving up
    pub nattempts: u32,
    /// delay between attempts
    pub backoff: Backoff,
    /// optional observer for every outcome
    pub monitor: Option<Monitor>,
}

impl Default for WorkerOpts {
    fn default() -> Self {
        WorkerOpts {
            nthreads: 1,
            throttle_ms: 0,
            eoq_backoff_ms: 500,
            nattempts: 3,
            backoff: Backoff::Constant(5_000),
            monitor: None,
        }
    }
}

struct WorkerCtx {
    client: Client,
    datastore: Arc<dyn DataStore>,
    codec: Option<Arc<dyn BlobCodec>>,
    queue: Arc<dyn WorkQueue>,
    opts: WorkerOpts,
    stop: Arc<AtomicBool>,
}

/// Handle to a running set of archival consumers.
///
/// Consumers run until [`TundraWorker::stop`] is called or the handle is
/// dropped.
pub struct TundraWorker {
    stop: Arc<AtomicBool>,
    // keeps the consumer threads alive
    _pool: SharedQueueThreadPool,
}

impl TundraWorker {
    /// signals every consumer to exit after its current message
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for TundraWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TundraStore {
    /// Spawns archival consumers over the given queue.
    ///
    /// Each consumer loops: dequeue a mark, DUMP the key, write the payload
    /// to the datastore, settle the mark. Failures retry with backoff up to
    /// `nattempts`, then surface through the log and the monitor; a worker
    /// left unhealthy while a server TTL is configured can lose data, so
    /// [`WorkerEvent::Failed`] is an operational alarm, not a statistic.
    pub fn worker(&self, queue: Arc<dyn WorkQueue>, opts: WorkerOpts) -> Result<TundraWorker> {
        let pool = SharedQueueThreadPool::new(opts.nthreads)?;
        let stop = Arc::new(AtomicBool::new(false));
        info!(nthreads = opts.nthreads, "starting tundra worker");
        for _ in 0..opts.nthreads {
            let ctx = Arc::new(WorkerCtx {
                client: self.client.clone(),
                datastore: Arc::clone(&self.datastore),
                codec: self.codec.clone(),
                queue: Arc::clone(&queue),
                opts: opts.clone(),
                stop: Arc::clone(&stop),
            });
            pool.spawn(move || consume(ctx));
        }
        Ok(TundraWorker { stop, _pool: pool })
    }
}

fn consume(ctx: Arc<WorkerCtx>) {
    while !ctx.stop.load(Ordering::SeqCst) {
        match ctx.queue.dequeue(TUNDRA_QUEUE) {
            Ok(Some(message)) => {
                handle(&ctx, message);
                if ctx.opts.throttle_ms > 0 {
                    thread::sleep(Duration::from_millis(ctx.opts.throttle_ms));
                }
            }
            Ok(None) => thread::sleep(Duration::from_millis(ctx.opts.eoq_backoff_ms)),
            Err(e) => {
                error!("tundra worker could not poll its queue: {}", e);
                thread::sleep(Duration::from_millis(ctx.opts.eoq_backoff_ms));
            }
        }
    }
    debug!("tundra consumer exiting");
}

fn handle(ctx: &WorkerCtx, message: QueueMessage) {
    let key = message.payload.clone();
    match archive(ctx, &key) {
        Ok(true) => {
            debug!(key = %key, "archived key");
            settle(ctx, &message.mid, None);
            notify(ctx, WorkerEvent::Archived { key });
        }
        Ok(false) => {
            // the key vanished between the dirty mark and now; its absence
            // on the server is authoritative, so the mark is dropped
            warn!(key = %key, "key no longer exists, dropping its mark");
            settle(ctx, &message.mid, None);
            notify(ctx, WorkerEvent::Skipped { key });
        }
        Err(e) => {
            if message.attempt >= ctx.opts.nattempts {
                error!(
                    key = %key,
                    attempts = message.attempt,
                    "giving up archiving key, value may be lost: {}", e
                );
                settle(ctx, &message.mid, None);
                notify(
                    ctx,
                    WorkerEvent::Failed {
                        key,
                        cause: e.to_string(),
                    },
                );
            } else {
                let backoff_ms = ctx.opts.backoff.delay_ms(message.attempt);
                warn!(
                    key = %key,
                    attempt = message.attempt,
                    backoff_ms,
                    "archiving key failed, will retry: {}", e
                );
                settle(ctx, &message.mid, Some(backoff_ms));
                notify(
                    ctx,
                    WorkerEvent::Retried {
                        key,
                        attempt: message.attempt,
                        backoff_ms,
                    },
                );
            }
        }
    }
}

/// Dumps the key and writes it to the datastore. `Ok(false)` means the key
/// no longer exists.
fn archive(ctx: &WorkerCtx, key: &str) -> Result<bool> {
    let reply = ctx.client.execute(|s| s.dump(key))?;
    let payload = match reply {
        Replies::One(Reply::Bulk(Bulk::Bytes(payload))) => payload,
        Replies::One(Reply::Bulk(Bulk::Nil)) => return Ok(false),
        other => {
            return Err(PipeError::Protocol(format!(
                "unexpected DUMP reply: {:?}",
                other
            )))
        }
    };
    let blob = match &ctx.codec {
        Some(codec) => codec.wrap(&payload)?,
        None => payload,
    };
    ctx.datastore.put(key, &blob)?;
    Ok(true)
}

fn settle(ctx: &WorkerCtx, mid: &str, backoff_ms: Option<u64>) {
    let outcome = match backoff_ms {
        Some(ms) => ctx.queue.nack(TUNDRA_QUEUE, mid, ms),
        None => ctx.queue.ack(TUNDRA_QUEUE, mid),
    };
    if let Err(e) = outcome {
        error!(mid = %mid, "could not settle queue message: {}", e);
    }
}

fn notify(ctx: &WorkerCtx, event: WorkerEvent) {
    if let Some(monitor) = &ctx.opts.monitor {
        monitor(&event);
    }
}
