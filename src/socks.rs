//! SOCKS5 client bridge
//!
//! Client half of RFC 1928 against the locally-listening tunnel proxy:
//! greeting, optional username/password sub-negotiation (RFC 1929), CONNECT,
//! then a transparent byte relay driven by a writer task and a reader task.

use crate::error::{Result, StackError};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, trace};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;
const RELAY_CHANNEL_DEPTH: usize = 64;

/// Proxy endpoint, credentials and timeouts
#[derive(Debug, Clone)]
pub struct SocksConfig {
    pub proxy_addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    /// TCP connect to the proxy
    pub connect_timeout: Duration,
    /// Each read during greeting/auth/CONNECT
    pub handshake_timeout: Duration,
    /// Steady-state relay reads
    pub read_timeout: Duration,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            proxy_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl SocksConfig {
    fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// CONNECT destination
#[derive(Debug, Clone)]
pub enum SocksTarget {
    /// Hostname or textual IP, sent as the domain address type
    Domain(String, u16),
    /// Literal IPv4 target
    Ip(Ipv4Addr, u16),
}

impl fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksTarget::Domain(host, port) => write!(f, "{}:{}", host, port),
            SocksTarget::Ip(ip, port) => write!(f, "{}:{}", ip, port),
        }
    }
}

/// Connect to the proxy and negotiate a relay to `target`. The returned
/// stream is transparent: bytes written reach the target, bytes read came
/// from it.
pub async fn dial(config: &SocksConfig, target: &SocksTarget) -> Result<TcpStream> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(config.proxy_addr))
        .await
        .map_err(|_| StackError::Timeout("proxy connect"))?
        .map_err(|e| StackError::ProxyConnect(e.to_string()))?;
    // Nagle adds latency on top of an already slow covert channel
    let _ = stream.set_nodelay(true);

    let mut stream = stream;
    timeout(config.handshake_timeout, handshake(config, &mut stream, target))
        .await
        .map_err(|_| StackError::Timeout("SOCKS5 handshake"))??;

    trace!("SOCKS5 relay established to {}", target);
    Ok(stream)
}

async fn handshake(config: &SocksConfig, stream: &mut TcpStream, target: &SocksTarget) -> Result<()> {
    let greeting: &[u8] = if config.requires_auth() {
        &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USERPASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(StackError::ProxyVersion(choice[0]));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USERPASS if config.requires_auth() => {
            let user = config.username.as_deref().unwrap_or_default();
            let pass = config.password.as_deref().unwrap_or_default();
            authenticate(stream, user, pass).await?;
        }
        other => return Err(StackError::ProxyAuthMethod(other)),
    }

    connect(stream, target).await
}

async fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(0x01);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(StackError::ProxyAuthFailed);
    }
    debug!("SOCKS5 auth accepted");
    Ok(())
}

async fn connect(stream: &mut TcpStream, target: &SocksTarget) -> Result<()> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match target {
        SocksTarget::Domain(host, port) => {
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
        SocksTarget::Ip(ip, port) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(StackError::ProxyVersion(head[0]));
    }
    if head[1] != 0x00 {
        return Err(StackError::ProxyConnectRejected(head[1]));
    }

    // Consume the bound address so the stream starts at relay position
    match head[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        ATYP_IPV6 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        other => {
            return Err(StackError::InvalidPacket(format!(
                "CONNECT reply address type {}",
                other
            )))
        }
    }
    Ok(())
}

/// Handle over a running relay. Cloneable; `disconnect` is idempotent and
/// stops both relay tasks.
#[derive(Clone)]
pub struct SocksBridge {
    outbound: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl SocksBridge {
    /// Queue bytes for the target, preserving submission order
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.outbound.send(data).await.map_err(|_| StackError::ChannelClosed)
    }

    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Split a negotiated relay stream into a writer task draining the outbound
/// channel and a reader task delivering inbound chunks, in arrival order, to
/// the returned receiver. The receiver closing marks proxy-side EOF.
pub fn spawn_relay(stream: TcpStream, config: &SocksConfig) -> (SocksBridge, mpsc::Receiver<Vec<u8>>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(RELAY_CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(RELAY_CHANNEL_DEPTH);
    let shutdown = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let read_timeout = config.read_timeout;

    let (mut read_half, mut write_half) = stream.into_split();

    {
        let shutdown = shutdown.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            while !closed.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    data = outbound_rx.recv() => match data {
                        Some(data) => {
                            if let Err(e) = write_half.write_all(&data).await {
                                debug!("proxy write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            closed.store(true, Ordering::SeqCst);
            shutdown.notify_waiters();
        });
    }

    {
        let shutdown = shutdown.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            while !closed.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    read = timeout(read_timeout, read_half.read(&mut buf)) => match read {
                        Err(_) => {
                            debug!("relay read timed out");
                            break;
                        }
                        Ok(Ok(0)) => {
                            trace!("relay stream EOF");
                            break;
                        }
                        Ok(Ok(n)) => {
                            if inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!("relay read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            closed.store(true, Ordering::SeqCst);
            shutdown.notify_waiters();
            // inbound_tx drops here, closing the flow's inbound channel
        });
    }

    (SocksBridge { outbound: outbound_tx, shutdown, closed }, inbound_rx)
}

/// Bridge with no backing socket, for state-machine tests
#[cfg(test)]
pub(crate) fn stub_bridge() -> (SocksBridge, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
    let bridge = SocksBridge {
        outbound: tx,
        shutdown: Arc::new(Notify::new()),
        closed: Arc::new(AtomicBool::new(false)),
    };
    (bridge, rx)
}
