//! Cluster routing: keyslot computation, the learned slot map, and the
//! sharded dispatcher that fans a pipeline out across nodes.
//!
//! Routing is learned, never assumed: the slot map starts empty, every
//! request falls back to the session's default node until a `MOVED` reply
//! teaches us better, and entries are only ever written from such replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel;
use tracing::{debug, warn};

use crate::error::{PipeError, Result};
use crate::executor;
use crate::pool::NodeSpec;
use crate::reply::{Reply, ServerError};
use crate::request::Request;
use crate::session::ClientInner;
use crate::thread_pool::ThreadPool;

/// number of keyslots a cluster hashes keys into
pub const KEYSLOTS: u16 = 16384;

/// redirect rounds before a request keeps its last error
pub(crate) const MAX_REDIRECTS: usize = 14;

/// default wall-clock budget for one node group's dispatch
pub(crate) const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// CRC16/CCITT-FALSE (XMODEM), the polynomial clusters hash keys with.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Computes the keyslot owning `key`.
///
/// When the key contains a `{...}` hash tag with a non-empty body, only the
/// body is hashed, so related keys can be pinned to one slot.
pub fn key_slot(key: &[u8]) -> u16 {
    let hashed = match hash_tag(key) {
        Some(tag) => tag,
        None => key,
    };
    crc16(hashed) % KEYSLOTS
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

/// Parses the target out of a `MOVED <slot> <host>:<port>` or
/// `ASK <slot> <host>:<port>` error line.
pub(crate) fn parse_redirect(message: &str) -> Option<(u16, NodeSpec)> {
    let mut tokens = message.split_whitespace();
    tokens.next()?;
    let slot = tokens.next()?.parse::<u16>().ok()?;
    let node = NodeSpec::parse(tokens.next()?).ok()?;
    Some((slot, node))
}

/// Learned keyslot → node map, shared by every session of a client.
///
/// An entry exists only because a server redirect pointed there; stale
/// entries are refreshed by the next `MOVED` they cause rather than being
/// invalidated pre-emptively.
#[derive(Default)]
pub struct KeyslotCache {
    inner: Mutex<HashMap<String, HashMap<u16, NodeSpec>>>,
}

impl KeyslotCache {
    /// creates an empty cache
    pub fn new() -> Self {
        KeyslotCache::default()
    }

    /// looks up the learned owner of a slot, if any
    pub fn lookup(&self, cluster: &str, slot: u16) -> Option<NodeSpec> {
        let inner = self.inner.lock().ok()?;
        inner.get(cluster)?.get(&slot).cloned()
    }

    /// records a slot owner reported by a `MOVED` redirect
    pub(crate) fn learn(&self, cluster: &str, slot: u16, node: NodeSpec) {
        if let Ok(mut inner) = self.inner.lock() {
            debug!(cluster, slot, node = %node, "learned keyslot owner");
            inner
                .entry(cluster.to_string())
                .or_insert_with(HashMap::new)
                .insert(slot, node);
        }
    }
}

/// Dispatches one flushed pipeline across the cluster.
///
/// Requests are grouped by resolved node, each group runs on the dispatch
/// pool with its own leased connection, and `MOVED`/`ASK` redirects are
/// retried for up to [`MAX_REDIRECTS`] rounds. The reply vector comes back
/// in program order regardless of per-node concurrency.
pub(crate) fn dispatch(
    client: &Arc<ClientInner>,
    cluster: &str,
    requests: Vec<Request>,
) -> Result<Vec<Reply>> {
    let total = requests.len();
    let mut results: Vec<Option<Reply>> = vec![None; total];
    let mut pending: Vec<Request> = Vec::with_capacity(total);
    for request in requests {
        if request.is_synthetic() {
            results[request.pos] = Some(request.parser.synthesize());
        } else {
            pending.push(request);
        }
    }

    let mut round = 0;
    while !pending.is_empty() && round < MAX_REDIRECTS {
        round += 1;
        let groups = group_by_node(client, cluster, &mut pending);
        debug!(round, groups = groups.len(), "dispatching pipeline shard(s)");
        run_round(client, cluster, groups, &mut results, &mut pending)?;
    }
    if !pending.is_empty() {
        warn!(
            unresolved = pending.len(),
            "requests still redirected after {} rounds", MAX_REDIRECTS
        );
    }

    results
        .into_iter()
        .map(|slot| {
            slot.ok_or_else(|| PipeError::Protocol("reply missing from dispatch".to_string()))
        })
        .collect()
}

/// Resolves each pending request to a node and groups them, preserving
/// program order inside every group.
fn group_by_node(
    client: &ClientInner,
    cluster: &str,
    pending: &mut Vec<Request>,
) -> Vec<(NodeSpec, Vec<Request>)> {
    let mut order: Vec<NodeSpec> = Vec::new();
    let mut groups: HashMap<NodeSpec, Vec<Request>> = HashMap::new();
    for mut request in pending.drain(..) {
        let node = match request.ask_target.take() {
            Some(node) => node,
            None => request
                .expected_slot
                .and_then(|slot| client.cache.lookup(cluster, slot))
                .unwrap_or_else(|| client.node.clone()),
        };
        let group = groups.entry(node.clone()).or_insert_with(Vec::new);
        if group.is_empty() {
            order.push(node);
        }
        group.push(request);
    }
    order
        .into_iter()
        .map(|node| {
            let group = groups.remove(&node).expect("group exists for ordered node");
            (node, group)
        })
        .collect()
}

type GroupOutcome = (usize, Vec<Request>, Result<Vec<Reply>>);

/// Runs one round of grouped dispatch, filling `results` and pushing
/// redirected requests back onto `pending`.
fn run_round(
    client: &Arc<ClientInner>,
    cluster: &str,
    groups: Vec<(NodeSpec, Vec<Request>)>,
    results: &mut Vec<Option<Reply>>,
    pending: &mut Vec<Request>,
) -> Result<()> {
    let ngroups = groups.len();
    let positions: Vec<Vec<usize>> = groups
        .iter()
        .map(|(_, group)| group.iter().map(|r| r.pos).collect())
        .collect();

    let (tx, rx) = channel::unbounded::<GroupOutcome>();
    for (gid, (node, group)) in groups.into_iter().enumerate() {
        let tx = tx.clone();
        let client_task = Arc::clone(client);
        client.dispatch_pool.spawn(move || {
            let outcome = run_group(&client_task, &node, &group);
            let _ = tx.send((gid, group, outcome));
        });
    }
    drop(tx);

    let deadline = Instant::now() + client.dispatch_timeout;
    let mut received = vec![false; ngroups];
    let mut collected = 0;
    while collected < ngroups {
        match rx.recv_deadline(deadline) {
            Ok((gid, group, outcome)) => {
                collected += 1;
                received[gid] = true;
                let replies = outcome?;
                for (request, reply) in group.into_iter().zip(replies) {
                    settle(client, cluster, request, reply, results, pending);
                }
            }
            Err(_) => break,
        }
    }

    // groups that never reported get a placeholder timeout error per request
    for (gid, done) in received.iter().enumerate() {
        if !*done {
            warn!(group = gid, "dispatch group timed out");
            for &pos in &positions[gid] {
                results[pos] = Some(Reply::Error(ServerError::synthesized(
                    "timeout",
                    format!(
                        "dispatch timed out after {}ms",
                        client.dispatch_timeout.as_millis()
                    ),
                )));
            }
        }
    }
    Ok(())
}

/// Executes one group on a leased connection to its node.
fn run_group(client: &ClientInner, node: &NodeSpec, group: &[Request]) -> Result<Vec<Reply>> {
    let started = Instant::now();
    let mut lease = client.pools.lease(node)?;
    let result = executor::execute(lease.conn(), group, client.freezer.as_ref());
    // a connection that failed, or that blew the deadline while the
    // dispatcher stopped waiting, must not be reused
    if result.is_err() || started.elapsed() > client.dispatch_timeout {
        lease.tag_failure();
    }
    result
}

enum Redirect {
    Moved(u16, NodeSpec),
    Ask(NodeSpec),
}

/// Places a reply at its request's position, re-queueing redirected requests.
fn settle(
    client: &ClientInner,
    cluster: &str,
    mut request: Request,
    reply: Reply,
    results: &mut Vec<Option<Reply>>,
    pending: &mut Vec<Request>,
) {
    let redirect = match &reply {
        Reply::Error(e) if e.prefix == "moved" => {
            parse_redirect(&e.message).map(|(slot, node)| Redirect::Moved(slot, node))
        }
        Reply::Error(e) if e.prefix == "ask" => {
            parse_redirect(&e.message).map(|(_slot, node)| Redirect::Ask(node))
        }
        _ => None,
    };

    // keep the last reply in place; a successful retry overwrites it
    results[request.pos] = Some(reply);
    match redirect {
        Some(Redirect::Moved(slot, node)) => {
            client.cache.learn(cluster, slot, node);
            request.asking = false;
            request.ask_target = None;
            pending.push(request);
        }
        Some(Redirect::Ask(node)) => {
            // one-shot: retried at the named node, never cached
            request.ask_target = Some(node);
            request.asking = true;
            pending.push(request);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_the_reference_vector() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn key_slot_is_stable_and_bounded() {
        assert_eq!(key_slot(b"mykey"), key_slot(b"mykey"));
        assert!(key_slot(b"mykey") < KEYSLOTS);
    }

    #[test]
    fn hash_tags_pin_related_keys_together() {
        assert_eq!(key_slot(b"{user:1}:profile"), key_slot(b"{user:1}:inbox"));
        assert_eq!(key_slot(b"{user:1}:profile"), key_slot(b"user:1"));
        assert_eq!(key_slot(b"foo{bar}baz"), key_slot(b"bar"));
        // an empty tag is no tag: the whole key is hashed
        assert_eq!(key_slot(b"{}x"), crc16(b"{}x") % KEYSLOTS);
    }

    #[test]
    fn parses_redirect_targets() {
        let (slot, node) = parse_redirect("MOVED 5123 10.0.0.2:6379").unwrap();
        assert_eq!(slot, 5123);
        assert_eq!(node, NodeSpec::parse("10.0.0.2:6379").unwrap());
        assert!(parse_redirect("ERR something else").is_none());
    }

    #[test]
    fn cache_learns_and_serves_owners() {
        let cache = KeyslotCache::new();
        assert_eq!(cache.lookup("main", 12), None);
        let node = NodeSpec::parse("10.0.0.9:7001").unwrap();
        cache.learn("main", 12, node.clone());
        assert_eq!(cache.lookup("main", 12), Some(node));
        assert_eq!(cache.lookup("other", 12), None);
    }
}
