//! Pooled DNS-over-TCP resolution through the tunnel proxy
//!
//! Every query would otherwise pay a full SOCKS5 handshake and CONNECT round
//! trip over the high-latency covert channel. A small pool of persistent
//! tunnel connections to the resolver amortizes that cost; queries use the
//! RFC 1035 section 4.2.2 two-byte length framing.

use crate::error::{Result, StackError};
use crate::socks::{self, SocksConfig, SocksTarget};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Clone)]
pub struct DnsPoolConfig {
    /// Idle connections retained
    pub max_idle: usize,
    /// An idle connection older than this is stale
    pub idle_timeout: Duration,
    /// Per-read bound during a query exchange
    pub query_timeout: Duration,
}

impl Default for DnsPoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            idle_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// A persistent SOCKS5-tunneled connection to one resolver
pub struct PooledConn {
    resolver: Ipv4Addr,
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConn {
    pub fn resolver(&self) -> Ipv4Addr {
        self.resolver
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the connection may still be handed out. Socket death is only
    /// discovered on use; the retry path covers that case.
    fn is_valid(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() < idle_timeout
    }

    /// One length-prefixed query/response exchange
    async fn exchange(&mut self, message: &[u8], query_timeout: Duration) -> Result<Vec<u8>> {
        if message.len() > u16::MAX as usize {
            return Err(StackError::Dns(format!("query of {} bytes exceeds framing", message.len())));
        }
        let mut framed = Vec::with_capacity(2 + message.len());
        framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
        framed.extend_from_slice(message);
        self.stream.write_all(&framed).await?;

        let mut len_buf = [0u8; 2];
        timeout(query_timeout, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| StackError::Timeout("DNS response"))??;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(StackError::Dns("zero-length response".into()));
        }

        let mut response = vec![0u8; len];
        timeout(query_timeout, self.stream.read_exact(&mut response))
            .await
            .map_err(|_| StackError::Timeout("DNS response"))??;
        self.last_used = Instant::now();
        Ok(response)
    }
}

/// Bounded LIFO pool of resolver connections through the SOCKS5 proxy
pub struct DnsTunnelPool {
    config: DnsPoolConfig,
    socks: SocksConfig,
    idle: Mutex<Vec<PooledConn>>,
}

impl DnsTunnelPool {
    pub fn new(socks: SocksConfig, config: DnsPoolConfig) -> Self {
        Self {
            config,
            socks,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Full SOCKS5 handshake and CONNECT to resolver:53
    async fn dial(&self, resolver: Ipv4Addr) -> Result<PooledConn> {
        let target = SocksTarget::Ip(resolver, DNS_PORT);
        let stream = socks::dial(&self.socks, &target).await?;
        debug!("DNS pool: new tunnel connection to {}", resolver);
        let now = Instant::now();
        Ok(PooledConn {
            resolver,
            stream,
            created_at: now,
            last_used: now,
        })
    }

    /// Most recently released connection first; stale or mismatched entries
    /// are closed on the way. Dials fresh when nothing usable remains.
    async fn acquire(&self, resolver: Ipv4Addr) -> Result<PooledConn> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(conn) if conn.resolver == resolver && conn.is_valid(self.config.idle_timeout) => {
                    trace!("DNS pool: reusing connection to {}", resolver);
                    return Ok(conn);
                }
                // Dropping the connection closes it
                Some(_) => continue,
                None => break,
            }
        }
        self.dial(resolver).await
    }

    /// Return a connection for reuse; closed instead when the pool is full
    /// or the connection went stale.
    fn release(&self, conn: PooledConn) {
        if !conn.is_valid(self.config.idle_timeout) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(conn);
        }
    }

    /// Resolve `query` against `resolver`, retrying exactly once on a fresh
    /// connection if the first attempt fails. A second failure is final.
    pub async fn resolve(&self, resolver: Ipv4Addr, query: &[u8]) -> Result<Vec<u8>> {
        match self.acquire(resolver).await {
            Ok(mut conn) => match conn.exchange(query, self.config.query_timeout).await {
                Ok(response) => {
                    self.release(conn);
                    return Ok(response);
                }
                Err(e) => {
                    debug!("pooled DNS connection failed ({}), retrying fresh", e);
                }
            },
            Err(e) => {
                debug!("DNS pool dial failed ({}), retrying fresh", e);
            }
        }

        let mut fresh = self.dial(resolver).await?;
        let response = fresh.exchange(query, self.config.query_timeout).await?;
        self.release(fresh);
        Ok(response)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Close every pooled connection
    pub fn drain(&self) {
        self.idle.lock().clear();
    }
}
