use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

use crate::core::{Config, Message};
use crate::network::Transport;
use crate::utils::{P2PError, Result};

/// One outbound TCP connection. A request holds the stream for the whole
/// send/receive exchange so concurrent callers never interleave frames.
pub struct Connection {
    pub addr: SocketAddr,
    stream: Mutex<TcpStream>,
    last_activity: Mutex<Instant>,
    max_frame_size: usize,
}

impl Connection {
    /// Connect to `addr` within `connect_timeout`.
    pub async fn open(addr: SocketAddr, connect_timeout: Duration, max_frame_size: usize) -> Result<Self> {
        let stream = Transport::connect(addr, connect_timeout).await?;
        Ok(Self {
            addr,
            stream: Mutex::new(stream),
            last_activity: Mutex::new(Instant::now()),
            max_frame_size,
        })
    }

    /// Send `message` and wait for the single frame that answers it.
    pub async fn request(&self, message: &Message, limit: Duration) -> Result<Message> {
        let mut stream = self.stream.lock().await;
        Transport::send_message_within(&mut *stream, message, limit).await?;
        let response =
            Transport::receive_message_within(&mut *stream, self.max_frame_size, limit).await?;
        *self.last_activity.lock().await = Instant::now();
        Ok(response)
    }

    /// Send without waiting for an answer.
    pub async fn send(&self, message: &Message, limit: Duration) -> Result<()> {
        let mut stream = self.stream.lock().await;
        Transport::send_message_within(&mut *stream, message, limit).await?;
        *self.last_activity.lock().await = Instant::now();
        Ok(())
    }

    /// Time since the last completed exchange.
    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    /// Shut down the write half; the peer sees end of stream.
    pub async fn close(&self) {
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            debug!("Error closing connection to {}: {}", self.addr, e);
        }
    }
}

/// Pool of reusable outbound connections keyed by remote address.
pub struct ConnectionManager {
    connections: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    max_connections: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_frame_size: usize,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Empty pool sized and timed from `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections: config.max_connections.max(1),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_connection_timeout,
            max_frame_size: config.max_frame_size,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(P2PError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Existing connection to `addr` or a freshly opened one. The flag tells
    /// whether the connection was reused.
    async fn get_or_connect(&self, addr: SocketAddr) -> Result<(Arc<Connection>, bool)> {
        self.ensure_open()?;
        if let Some(conn) = self.connections.read().await.get(&addr) {
            return Ok((conn.clone(), true));
        }
        let fresh = self.connect(addr).await?;
        Ok((fresh, false))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        let conn = Arc::new(Connection::open(addr, self.connect_timeout, self.max_frame_size).await?);

        self.evict_if_full().await;
        let mut connections = self.connections.write().await;
        self.ensure_open()?;
        if let Some(existing) = connections.get(&addr) {
            // Lost a race with another caller; keep theirs
            return Ok(existing.clone());
        }
        connections.insert(addr, conn.clone());
        debug!("Connection added: {} ({} open)", addr, connections.len());
        Ok(conn)
    }

    async fn evict_if_full(&self) {
        let candidates: Vec<(SocketAddr, Arc<Connection>)> = {
            let connections = self.connections.read().await;
            if connections.len() < self.max_connections {
                return;
            }
            connections.iter().map(|(a, c)| (*a, c.clone())).collect()
        };

        let mut oldest: Option<(SocketAddr, Duration)> = None;
        for (addr, conn) in candidates {
            let idle = conn.idle_for().await;
            if oldest.is_none_or(|(_, longest)| idle > longest) {
                oldest = Some((addr, idle));
            }
        }
        if let Some((addr, _)) = oldest {
            warn!("Connection limit {} reached, dropping {}", self.max_connections, addr);
            self.remove(&addr).await;
        }
    }

    /// Request/response exchange over the pooled connection to `addr`.
    /// A reused connection that turns out to be broken is replaced once.
    pub async fn request(&self, addr: SocketAddr, message: &Message, limit: Duration) -> Result<Message> {
        let (conn, reused) = self.get_or_connect(addr).await?;
        match conn.request(message, limit).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.discard(&addr, &conn).await;
                if !(reused && e.is_connection_level()) {
                    return Err(e);
                }
                debug!("Pooled connection to {} was stale ({}), reconnecting", addr, e);
                let fresh = self.connect(addr).await?;
                let result = fresh.request(message, limit).await;
                if result.is_err() {
                    self.discard(&addr, &fresh).await;
                }
                result
            }
        }
    }

    /// One-way frame over the pooled connection to `addr`.
    pub async fn send(&self, addr: SocketAddr, message: &Message, limit: Duration) -> Result<()> {
        let (conn, _) = self.get_or_connect(addr).await?;
        let result = conn.send(message, limit).await;
        if result.is_err() {
            self.discard(&addr, &conn).await;
        }
        result
    }

    /// A connection outside the pool, owned by the caller (file sessions).
    pub async fn open_dedicated(&self, addr: SocketAddr) -> Result<TcpStream> {
        self.ensure_open()?;
        Transport::connect(addr, self.connect_timeout).await
    }

    /// Drop `conn` from the pool if it is still the pooled one for `addr`.
    async fn discard(&self, addr: &SocketAddr, conn: &Arc<Connection>) {
        let mut connections = self.connections.write().await;
        if connections.get(addr).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            connections.remove(addr);
        }
    }

    /// Close and forget the pooled connection to `addr`.
    pub async fn remove(&self, addr: &SocketAddr) -> bool {
        let removed = self.connections.write().await.remove(addr);
        match removed {
            Some(conn) => {
                conn.close().await;
                debug!("Connection removed: {}", addr);
                true
            }
            None => false,
        }
    }

    /// Close connections idle longer than the idle timeout and return their addresses.
    pub async fn cleanup_stale_connections(&self) -> Vec<SocketAddr> {
        let snapshot: Vec<(SocketAddr, Arc<Connection>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(a, c)| (*a, c.clone()))
            .collect();

        let mut stale = Vec::new();
        for (addr, conn) in snapshot {
            if conn.idle_for().await > self.idle_timeout {
                stale.push(addr);
            }
        }
        for addr in &stale {
            self.remove(addr).await;
            debug!("Removed stale connection: {}", addr);
        }
        stale
    }

    /// Close every pooled connection and refuse new ones.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<Connection>> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for conn in drained {
            conn.close().await;
        }
        info!("Closed {} outbound connections", count);
    }

    /// Number of pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
