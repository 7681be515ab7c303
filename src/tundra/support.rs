//! In-memory collaborator implementations.
//!
//! Production deployments back these traits with a real blob store and a
//! real reliable queue; these implementations keep examples and tests
//! self-contained while exercising the same contracts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{PipeError, Result};

use super::{DataStore, QueueMessage, WorkQueue};

/// A [`DataStore`] over a process-local map.
#[derive(Default)]
pub struct MemoryDataStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDataStore {
    /// creates an empty store
    pub fn new() -> Self {
        MemoryDataStore::default()
    }

    /// true when a blob is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(key))
            .unwrap_or(false)
    }
}

impl DataStore for MemoryDataStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        let mut blobs = lock(&self.blobs)?;
        blobs.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = lock(&self.blobs)?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| PipeError::Datastore(format!("no blob stored for key {:?}", key)))
    }
}

struct StoredMessage {
    mid: String,
    payload: String,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    delayed: Vec<(Instant, StoredMessage)>,
    locked: HashMap<String, StoredMessage>,
}

impl QueueState {
    fn is_pending(&self, mid: &str) -> bool {
        self.ready.iter().any(|m| m.mid == mid) || self.delayed.iter().any(|(_, m)| m.mid == mid)
    }

    fn promote_due(&mut self) {
        let now = Instant::now();
        let mut still_delayed = Vec::with_capacity(self.delayed.len());
        for (due, message) in self.delayed.drain(..) {
            if due <= now {
                self.ready.push_back(message);
            } else {
                still_delayed.push((due, message));
            }
        }
        self.delayed = still_delayed;
    }
}

/// A [`WorkQueue`] over process-local state, with the contract's dedupe:
/// enqueueing an id that is already pending is a no-op, and an id locked by
/// a consumer only accepts a duplicate when the caller allows it.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueue {
    /// creates an empty queue registry
    pub fn new() -> Self {
        MemoryQueue::default()
    }

    /// messages currently ready or delayed on `queue`
    pub fn backlog(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|queues| {
                queues
                    .get(queue)
                    .map(|q| q.ready.len() + q.delayed.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

impl WorkQueue for MemoryQueue {
    fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        mid: &str,
        allow_locked_dupe: bool,
    ) -> Result<()> {
        let mut queues = lock(&self.queues)?;
        let state = queues.entry(queue.to_string()).or_insert_with(QueueState::default);
        if state.is_pending(mid) {
            return Ok(());
        }
        if state.locked.contains_key(mid) && !allow_locked_dupe {
            return Ok(());
        }
        state.ready.push_back(StoredMessage {
            mid: mid.to_string(),
            payload: payload.to_string(),
            attempt: 0,
        });
        Ok(())
    }

    fn dequeue(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let mut queues = lock(&self.queues)?;
        let state = match queues.get_mut(queue) {
            Some(state) => state,
            None => return Ok(None),
        };
        state.promote_due();
        let mut message = match state.ready.pop_front() {
            Some(message) => message,
            None => return Ok(None),
        };
        message.attempt += 1;
        let taken = QueueMessage {
            mid: message.mid.clone(),
            payload: message.payload.clone(),
            attempt: message.attempt,
        };
        state.locked.insert(message.mid.clone(), message);
        Ok(Some(taken))
    }

    fn ack(&self, queue: &str, mid: &str) -> Result<()> {
        let mut queues = lock(&self.queues)?;
        if let Some(state) = queues.get_mut(queue) {
            state.locked.remove(mid);
        }
        Ok(())
    }

    fn nack(&self, queue: &str, mid: &str, backoff_ms: u64) -> Result<()> {
        let mut queues = lock(&self.queues)?;
        if let Some(state) = queues.get_mut(queue) {
            if let Some(message) = state.locked.remove(mid) {
                let due = Instant::now() + Duration::from_millis(backoff_ms);
                state.delayed.push((due, message));
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PipeError::Locking("tundra support mutex poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_round_trips_blobs() {
        let store = MemoryDataStore::new();
        store.put("k1", &[1, 2, 3]).unwrap();
        assert_eq!(store.fetch("k1").unwrap(), vec![1, 2, 3]);
        assert!(store.fetch("k2").is_err());
    }

    #[test]
    fn enqueue_dedupes_by_message_id() {
        let queue = MemoryQueue::new();
        queue.enqueue("q", "k1", "k1", true).unwrap();
        queue.enqueue("q", "k1", "k1", true).unwrap();
        assert_eq!(queue.backlog("q"), 1);
    }

    #[test]
    fn locked_messages_accept_dupes_only_when_allowed() {
        let queue = MemoryQueue::new();
        queue.enqueue("q", "k1", "k1", true).unwrap();
        let taken = queue.dequeue("q").unwrap().unwrap();
        assert_eq!(taken.attempt, 1);

        queue.enqueue("q", "k1", "k1", false).unwrap();
        assert_eq!(queue.backlog("q"), 0);

        queue.enqueue("q", "k1", "k1", true).unwrap();
        assert_eq!(queue.backlog("q"), 1);
    }

    #[test]
    fn nack_delays_redelivery() {
        let queue = MemoryQueue::new();
        queue.enqueue("q", "k1", "k1", true).unwrap();
        let taken = queue.dequeue("q").unwrap().unwrap();
        queue.nack("q", &taken.mid, 10).unwrap();
        // not due yet
        assert!(queue.dequeue("q").unwrap().is_none());
        std::thread::sleep(Duration::from_millis(20));
        let retaken = queue.dequeue("q").unwrap().unwrap();
        assert_eq!(retaken.attempt, 2);
    }

    #[test]
    fn ack_settles_for_good() {
        let queue = MemoryQueue::new();
        queue.enqueue("q", "k1", "k1", true).unwrap();
        let taken = queue.dequeue("q").unwrap().unwrap();
        queue.ack("q", &taken.mid).unwrap();
        assert!(queue.dequeue("q").unwrap().is_none());
        assert_eq!(queue.backlog("q"), 0);
    }
}
