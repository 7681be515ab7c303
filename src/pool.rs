//! Connection pooling.
//!
//! Each server node gets its own bounded pool of buffered TCP connections.
//! Leases are RAII: dropping a [`PooledConnection`] returns the connection to
//! its pool unless a failure was tagged onto it, in which case the connection
//! is discarded and its slot freed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipeError, Result};

/// Address of one server node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
    /// host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl NodeSpec {
    /// builds a node spec from a `host:port` string
    ///
    /// # Errors
    /// Returns [`PipeError::Parsing`] when the string has no port or the port
    /// is not a number.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| PipeError::Parsing(format!("address {:?} is missing a port", addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| PipeError::Parsing(format!("invalid port in address {:?}", addr)))?;
        Ok(NodeSpec {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Tunables shared by every per-node pool a client creates.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// maximum idle connections kept warm per node
    pub max_idle: usize,
    /// maximum total connections per node (idle + leased)
    pub max_total: usize,
    /// optional TCP read timeout
    pub read_timeout: Option<Duration>,
    /// optional TCP write timeout
    pub write_timeout: Option<Duration>,
    /// optional TCP connect timeout
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    node: NodeSpec,
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

/// Bounded pool of connections to one node.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// creates an empty pool for the given node
    pub fn new(node: NodeSpec, settings: PoolSettings) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                node,
                settings: settings.clone(),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(settings.max_idle),
                    total: 0,
                }),
            }),
        }
    }

    /// Leases a connection, reusing an idle one when available.
    ///
    /// # Errors
    /// Returns [`PipeError::PoolExhausted`] when the pool is at capacity, or
    /// the connect error when a fresh connection could not be established.
    pub fn lease(&self) -> Result<PooledConnection> {
        if let Some(conn) = self.pop_idle()? {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }
        if !self.try_reserve()? {
            return Err(PipeError::PoolExhausted);
        }
        match Connection::connect(&self.inner.node, &self.inner.settings) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    fn pop_idle(&self) -> Result<Option<Connection>> {
        let mut state = lock(&self.inner.state)?;
        Ok(state.idle.pop_front())
    }

    fn try_reserve(&self) -> Result<bool> {
        let mut state = lock(&self.inner.state)?;
        if state.total >= self.inner.settings.max_total {
            return Ok(false);
        }
        state.total += 1;
        Ok(true)
    }

    fn release_slot(&self) {
        if let Ok(mut state) = lock(&self.inner.state) {
            state.total = state.total.saturating_sub(1);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PipeError::Locking("connection pool mutex poisoned".to_string()))
}

/// RAII lease over one pooled connection.
///
/// Dropping the lease returns the connection; [`PooledConnection::tag_failure`]
/// marks it contaminated so the drop discards it instead.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    failed: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            failed: false,
        }
    }

    /// borrows the leased connection
    pub(crate) fn conn(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds a connection")
    }

    /// marks the connection contaminated; it will not return to the pool
    pub(crate) fn tag_failure(&mut self) {
        self.failed = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if self.failed {
            debug!(node = %self.pool.node, "discarding contaminated connection");
            if let Ok(mut state) = lock(&self.pool.state) {
                state.total = state.total.saturating_sub(1);
            }
            return;
        }
        if let Ok(mut state) = lock(&self.pool.state) {
            if state.idle.len() < self.pool.settings.max_idle {
                state.idle.push_back(conn);
            } else {
                state.total = state.total.saturating_sub(1);
            }
        }
    }
}

/// One buffered TCP connection.
pub struct Connection {
    reader: BufReader<TcpStream>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(node: &NodeSpec, settings: &PoolSettings) -> Result<Self> {
        let stream = connect_stream(node, settings)?;
        if let Some(timeout) = settings.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = settings.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        stream.set_nodelay(true)?;
        debug!(node = %node, "opened connection");
        Ok(Connection {
            reader: BufReader::new(stream),
            write_buf: Vec::with_capacity(256),
        })
    }

    /// hands out the pipeline staging buffer, cleared
    pub(crate) fn write_buf(&mut self) -> &mut Vec<u8> {
        self.write_buf.clear();
        &mut self.write_buf
    }

    /// writes the staged pipeline and flushes the stream once
    pub(crate) fn send_staged(&mut self) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    /// borrows the buffered input side
    pub(crate) fn reader(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.reader
    }
}

fn connect_stream(node: &NodeSpec, settings: &PoolSettings) -> Result<TcpStream> {
    match settings.connect_timeout {
        Some(timeout) => {
            let addr = (node.host.as_str(), node.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| PipeError::Parsing(format!("could not resolve {}", node)))?;
            Ok(TcpStream::connect_timeout(&addr, timeout)?)
        }
        None => Ok(TcpStream::connect((node.host.as_str(), node.port))?),
    }
}

/// Registry handing out one [`ConnectionPool`] per node.
pub(crate) struct Pools {
    settings: PoolSettings,
    pools: Mutex<HashMap<NodeSpec, ConnectionPool>>,
}

impl Pools {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        Pools {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// leases a connection to the given node, creating its pool on first use
    pub(crate) fn lease(&self, node: &NodeSpec) -> Result<PooledConnection> {
        let pool = {
            let mut pools = self
                .pools
                .lock()
                .map_err(|_| PipeError::Locking("pool registry mutex poisoned".to_string()))?;
            pools
                .entry(node.clone())
                .or_insert_with(|| ConnectionPool::new(node.clone(), self.settings.clone()))
                .clone()
        };
        pool.lease()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_specs() {
        let node = NodeSpec::parse("10.0.0.2:6379").unwrap();
        assert_eq!(node.host, "10.0.0.2");
        assert_eq!(node.port, 6379);
        assert_eq!(node.to_string(), "10.0.0.2:6379");
    }

    #[test]
    fn rejects_bad_node_specs() {
        assert!(NodeSpec::parse("no-port").is_err());
        assert!(NodeSpec::parse("host:notaport").is_err());
    }
}
