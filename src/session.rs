//! The session runtime: a per-call request queue that collects commands
//! issued anywhere in the caller's code and flushes them as one pipeline.
//!
//! Every reply returned to a caller corresponds positionally to exactly one
//! request its code pushed, including synthetic values mixed in with
//! [`Session::return_value`]. Nested [`Session::with_replies`] scopes flush
//! early and hand their replies back immediately, while the enclosing
//! scope's replies are preserved in order.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::{self, KeyslotCache};
use crate::error::{PipeError, Result};
use crate::executor;
use crate::freeze::{Freezer, JsonFreezer};
use crate::pool::{NodeSpec, PoolSettings, Pools};
use crate::reply::Reply;
use crate::request::{Parser, Request};
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// default server address, e.g. `"127.0.0.1:6379"`
    pub addr: String,
    /// cluster name; `Some` switches flushes to the sharded dispatcher
    pub cluster: Option<String>,
    /// per-node connection pool settings
    pub pool: PoolSettings,
    /// threads in the cluster dispatch pool
    pub dispatch_threads: u32,
    /// wall-clock budget per dispatched node group
    pub dispatch_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            cluster: None,
            pool: PoolSettings::default(),
            dispatch_threads: 8,
            dispatch_timeout: cluster::DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

pub(crate) struct ClientInner {
    pub(crate) node: NodeSpec,
    pub(crate) cluster: Option<String>,
    pub(crate) pools: Pools,
    pub(crate) cache: KeyslotCache,
    pub(crate) dispatch_pool: SharedQueueThreadPool,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) freezer: Arc<dyn Freezer>,
}

/// Handle to one server (or one cluster seed) plus the shared client state:
/// connection pools, the learned keyslot map, and the dispatch thread pool.
///
/// Cloning is cheap; clones share all of the above.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// creates a client for the given `host:port` with default configuration
    pub fn connect(addr: &str) -> Result<Client> {
        Client::with_config(ClientConfig {
            addr: addr.to_string(),
            ..ClientConfig::default()
        })
    }

    /// creates a client with the given configuration and the JSON freezer
    pub fn with_config(config: ClientConfig) -> Result<Client> {
        Client::with_freezer(config, Arc::new(JsonFreezer))
    }

    /// creates a client with a custom freezer for tunneled objects
    pub fn with_freezer(config: ClientConfig, freezer: Arc<dyn Freezer>) -> Result<Client> {
        let node = NodeSpec::parse(&config.addr)?;
        let dispatch_pool = SharedQueueThreadPool::new(config.dispatch_threads)?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                node,
                cluster: config.cluster,
                pools: Pools::new(config.pool),
                cache: KeyslotCache::new(),
                dispatch_pool,
                dispatch_timeout: config.dispatch_timeout,
                freezer,
            }),
        })
    }

    /// Opens a session, runs `body`, and flushes with single-reply
    /// semantics: a lone reply is unwrapped, and if it is an error it is
    /// raised as [`PipeError::Reply`]. Pipelines with any other request
    /// count come back as [`Replies::Many`].
    pub fn execute<F>(&self, body: F) -> Result<Replies>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut session = Session::new(Arc::clone(&self.inner));
        body(&mut session)?;
        session.flush(false)
    }

    /// Opens a session, runs `body`, and returns every reply in order.
    /// Error replies stay in the vector for per-item inspection.
    pub fn pipeline<F>(&self, body: F) -> Result<Vec<Reply>>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut session = Session::new(Arc::clone(&self.inner));
        body(&mut session)?;
        Ok(session.flush(true)?.into_vec())
    }

    /// the keyslot map this client has learned from redirects
    pub fn keyslot_cache(&self) -> &KeyslotCache {
        &self.inner.cache
    }
}

/// Replies from one flushed session.
#[derive(Debug, Clone, PartialEq)]
pub enum Replies {
    /// a lone reply, already checked not to be an error
    One(Reply),
    /// zero or multiple replies, in program order, errors included in place
    Many(Vec<Reply>),
}

impl Replies {
    /// flattens into a vector either way
    pub fn into_vec(self) -> Vec<Reply> {
        match self {
            Replies::One(reply) => vec![reply],
            Replies::Many(replies) => replies,
        }
    }

    /// the lone reply, when there was exactly one
    pub fn one(self) -> Option<Reply> {
        match self {
            Replies::One(reply) => Some(reply),
            Replies::Many(_) => None,
        }
    }
}

/// One in-flight session: the request queue and the current parser.
pub struct Session {
    client: Arc<ClientInner>,
    queue: Vec<Request>,
    parser: Parser,
}

impl Session {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        Session {
            client,
            queue: Vec::new(),
            parser: Parser::default(),
        }
    }

    /// appends one request, already annotated, to the queue
    pub(crate) fn push(&mut self, request: Request) {
        self.queue.push(request);
    }

    #[cfg(test)]
    pub(crate) fn queued_for_test(&self) -> &[Request] {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn drain_for_test(&mut self) {
        self.queue.clear();
    }

    /// the parser commands issued right now would be annotated with
    pub(crate) fn current_parser(&self) -> Parser {
        self.parser.clone()
    }

    pub(crate) fn freezer(&self) -> &dyn Freezer {
        self.client.freezer.as_ref()
    }

    /// Mixes a synthetic value into the pipeline's reply vector.
    ///
    /// The value is threaded through the currently scoped parser, so user
    /// parsers rewrite it like any wire reply, but no bytes are emitted and
    /// no reply is read for it.
    pub fn return_value(&mut self, reply: Reply) {
        let parser = self.current_parser().with_dummy(reply);
        self.push(Request::synthetic(parser));
    }

    /// re-queues an already-parsed reply with the null parser
    fn push_preparsed(&mut self, reply: Reply) {
        self.push(Request::synthetic(Parser::default().with_dummy(reply)));
    }

    /// Scopes `parser` over `body`, replacing the current parser; the
    /// previous parser is restored on exit.
    pub fn parse<T, F>(&mut self, parser: Parser, body: F) -> T
    where
        F: FnOnce(&mut Session) -> T,
    {
        let prev = mem::replace(&mut self.parser, parser);
        let out = body(self);
        self.parser = prev;
        out
    }

    /// Scopes `parser` *composed over* the current parser: the inherited
    /// parser runs first, the new one rewrites its output.
    pub fn parse_compose<T, F>(&mut self, parser: Parser, body: F) -> T
    where
        F: FnOnce(&mut Session) -> T,
    {
        let composed = Parser::compose(&parser, &self.parser);
        self.parse(composed, body)
    }

    /// Collects replies for requests issued inside `body`, returning them
    /// immediately with single-reply semantics. Requests already pending in
    /// the enclosing scope are flushed first and restored afterwards as
    /// pre-parsed synthetic values, so the enclosing reply vector keeps one
    /// entry per request in program order.
    pub fn with_replies<F>(&mut self, body: F) -> Result<Replies>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        self.nested(false, body)
    }

    /// [`Session::with_replies`] without the single-reply unwrap
    pub fn with_replies_pipeline<F>(&mut self, body: F) -> Result<Vec<Reply>>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        Ok(self.nested(true, body)?.into_vec())
    }

    fn nested<F>(&mut self, as_pipeline: bool, body: F) -> Result<Replies>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let held = mem::take(&mut self.queue);
        let stashed = self.collect(held)?;

        let body_result = body(self);
        let inner = mem::take(&mut self.queue);
        let outcome = match body_result {
            Ok(()) => self
                .collect(inner)
                .and_then(|replies| unwrap_replies(replies, as_pipeline)),
            Err(e) => Err(e),
        };

        // restore the enclosing scope's replies whether or not the body
        // succeeded
        for reply in stashed {
            self.push_preparsed(reply);
        }
        outcome
    }

    /// flushes the queue and applies the single-reply unwrap rule
    pub(crate) fn flush(&mut self, as_pipeline: bool) -> Result<Replies> {
        let requests = mem::take(&mut self.queue);
        let replies = self.collect(requests)?;
        unwrap_replies(replies, as_pipeline)
    }

    /// sends `requests` through the right executor and returns raw replies
    fn collect(&mut self, mut requests: Vec<Request>) -> Result<Vec<Reply>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for (pos, request) in requests.iter_mut().enumerate() {
            request.pos = pos;
        }
        debug!(requests = requests.len(), "flushing pipeline");
        match self.client.cluster.clone() {
            Some(cluster) => cluster::dispatch(&self.client, &cluster, requests),
            None => {
                if requests.iter().all(Request::is_synthetic) {
                    return Ok(executor::synthesize_all(&requests));
                }
                let mut lease = self.client.pools.lease(&self.client.node)?;
                let result =
                    executor::execute(lease.conn(), &requests, self.client.freezer.as_ref());
                if result.is_err() {
                    lease.tag_failure();
                }
                result
            }
        }
    }
}

fn unwrap_replies(mut replies: Vec<Reply>, as_pipeline: bool) -> Result<Replies> {
    if !as_pipeline && replies.len() == 1 {
        match replies.pop().expect("length checked") {
            Reply::Error(e) => Err(PipeError::from(e)),
            reply => Ok(Replies::One(reply)),
        }
    } else {
        Ok(Replies::Many(replies))
    }
}
