//! In-process SOCKS5 server driving the real dial and relay paths in tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Knobs for misbehaving-proxy scenarios
#[derive(Debug, Clone, Copy)]
pub(crate) struct MockProxyOpts {
    /// Method byte selected in the greeting reply
    pub method: u8,
    /// Status byte of the auth sub-negotiation reply
    pub auth_status: u8,
    /// REP byte of the CONNECT reply
    pub connect_status: u8,
    /// Version byte used in replies
    pub version: u8,
}

impl Default for MockProxyOpts {
    fn default() -> Self {
        Self {
            method: 0x00,
            auth_status: 0x00,
            connect_status: 0x00,
            version: 0x05,
        }
    }
}

/// A relay accepted by the mock, positioned just after the CONNECT reply
pub(crate) struct MockSession {
    pub stream: TcpStream,
    /// CONNECT destination as "host:port"
    pub target: String,
    /// "user:pass" when sub-negotiation ran
    pub auth: Option<String>,
}

pub(crate) struct MockProxy {
    pub addr: SocketAddr,
    /// Number of TCP connections accepted (i.e. dials observed)
    pub dials: Arc<AtomicUsize>,
    pub sessions: mpsc::Receiver<MockSession>,
}

pub(crate) async fn spawn_mock_proxy(opts: MockProxyOpts) -> MockProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dials = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel(16);

    let accepted = dials.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(Some(session)) = serve(stream, opts).await {
                    let _ = tx.send(session).await;
                }
            });
        }
    });

    MockProxy { addr, dials, sessions: rx }
}

async fn serve(mut stream: TcpStream, opts: MockProxyOpts) -> std::io::Result<Option<MockSession>> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[opts.version, opts.method]).await?;
    if opts.version != 0x05 || (opts.method != 0x00 && opts.method != 0x02) {
        return Ok(None);
    }

    let mut auth = None;
    if opts.method == 0x02 {
        let mut ver = [0u8; 1];
        stream.read_exact(&mut ver).await?;
        let mut ulen = [0u8; 1];
        stream.read_exact(&mut ulen).await?;
        let mut user = vec![0u8; ulen[0] as usize];
        stream.read_exact(&mut user).await?;
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await?;
        let mut pass = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut pass).await?;
        stream.write_all(&[0x01, opts.auth_status]).await?;
        if opts.auth_status != 0x00 {
            return Ok(None);
        }
        auth = Some(format!(
            "{}:{}",
            String::from_utf8_lossy(&user),
            String::from_utf8_lossy(&pass)
        ));
    }

    // CONNECT: VER CMD RSV ATYP ...
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    let target = match req[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            format!("{}.{}.{}.{}:{}", rest[0], rest[1], rest[2], rest[3], port)
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut host = vec![0u8; len[0] as usize];
            stream.read_exact(&mut host).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            format!("{}:{}", String::from_utf8_lossy(&host), u16::from_be_bytes(port))
        }
        _ => return Ok(None),
    };

    let mut reply = vec![0x05, opts.connect_status, 0x00, 0x01];
    reply.extend_from_slice(&[127, 0, 0, 1]);
    reply.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&reply).await?;
    if opts.connect_status != 0x00 {
        return Ok(None);
    }

    Ok(Some(MockSession { stream, target, auth }))
}

/// Answer length-prefixed DNS-over-TCP queries on a relay session until it
/// closes. Each response echoes the query with `marker` appended.
pub(crate) async fn serve_dns_echo(mut session: MockSession, marker: u8) {
    loop {
        let mut len_buf = [0u8; 2];
        if session.stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        if session.stream.read_exact(&mut query).await.is_err() {
            return;
        }
        let mut response = query;
        response.push(marker);
        let mut framed = Vec::with_capacity(2 + response.len());
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        if session.stream.write_all(&framed).await.is_err() {
            return;
        }
    }
}
