//! Engine: dispatch loop, worker pools and lifecycle
//!
//! One task reads frames from the virtual device and demuxes them: TCP to the
//! flow table, UDP port 53 to the DNS workers, everything else dropped. All
//! response frames funnel through a single bounded channel drained by the one
//! task holding the device write half, so emitted frames never interleave.
//!
//! Proxy dials run on their own tasks gated by a semaphore so a slow covert
//! channel cannot stall the reader; DNS resolution runs on a small fixed
//! worker pool behind a drop-oldest queue.

use crate::dns::{DnsPoolConfig, DnsTunnelPool, DNS_PORT};
use crate::error::{Result, StackError};
use crate::packet::{self, Ipv4Packet, TcpFlags, TcpSegment};
use crate::socks::{self, SocksConfig, SocksTarget};
use crate::stats::StackStats;
use crate::tcp::{FlowAction, FlowKey, FlowTable, TcpFlow};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, trace, warn};

/// Window advertised on every emitted segment. Nothing here does window
/// management; the value just has to be large enough not to throttle clients.
const DEFAULT_WINDOW: u16 = 65535;

/// Stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Local SOCKS5 endpoint and timeouts
    pub socks: SocksConfig,
    /// DNS connection pool tuning
    pub dns: DnsPoolConfig,
    /// Upstream resolver for intercepted queries. The destination address in
    /// the intercepted packet is ignored; it is usually an unreachable
    /// private address handed to the client by the platform.
    pub dns_resolver: Ipv4Addr,
    /// MTU configured on the virtual device
    pub mtu: usize,
    /// Concurrent SOCKS5 dials for new flows
    pub dial_concurrency: usize,
    /// DNS resolution workers
    pub dns_workers: usize,
    /// Queued (not yet started) DNS queries before drop-oldest kicks in
    pub dns_queue_depth: usize,
    /// Device write channel depth
    pub write_channel_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            socks: SocksConfig::default(),
            dns: DnsPoolConfig::default(),
            dns_resolver: Ipv4Addr::new(8, 8, 8, 8),
            mtu: packet::DEFAULT_MTU,
            dial_concurrency: 8,
            dns_workers: 2,
            dns_queue_depth: 4,
            write_channel_depth: 4096,
        }
    }
}

/// Builder for fluent configuration
pub struct StackBuilder {
    config: StackConfig,
    events: Option<mpsc::UnboundedSender<StackEvent>>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self {
            config: StackConfig::default(),
            events: None,
        }
    }

    pub fn proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.config.socks.proxy_addr = addr;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.socks.username = Some(username.into());
        self.config.socks.password = Some(password.into());
        self
    }

    pub fn dns_resolver(mut self, resolver: Ipv4Addr) -> Self {
        self.config.dns_resolver = resolver;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn dial_concurrency(mut self, permits: usize) -> Self {
        self.config.dial_concurrency = permits;
        self
    }

    pub fn dns_workers(mut self, workers: usize) -> Self {
        self.config.dns_workers = workers;
        self
    }

    pub fn event_sink(mut self, tx: mpsc::UnboundedSender<StackEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> WarrenStack {
        let mut stack = WarrenStack::new(self.config);
        if let Some(tx) = self.events {
            stack.set_event_sink(tx);
        }
        stack
    }
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle notifications for the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    Started,
    Stopped,
    FlowOpened(FlowKey),
    FlowClosed(FlowKey),
    DialFailed(FlowKey),
    DnsQueryDropped,
}

/// An intercepted DNS query waiting for a worker
struct DnsJob {
    client: SocketAddrV4,
    /// The destination the client addressed; replies are sourced from it
    server: SocketAddrV4,
    query: Vec<u8>,
}

/// Bounded queue with drop-oldest overflow. DNS clients retry on their own,
/// so shedding the stalest query beats blocking the reader.
struct DnsQueue {
    jobs: Mutex<VecDeque<DnsJob>>,
    depth: usize,
    // One permit per queued job; closing wakes the workers for shutdown
    available: Semaphore,
}

impl DnsQueue {
    fn new(depth: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            available: Semaphore::new(0),
        }
    }

    /// Enqueue a job, returning the job that was shed if the queue was full
    fn push(&self, job: DnsJob) -> Option<DnsJob> {
        let mut jobs = self.jobs.lock();
        let dropped = if jobs.len() >= self.depth {
            jobs.pop_front()
        } else {
            None
        };
        jobs.push_back(job);
        drop(jobs);
        // Permit count stays equal to the queue length across an overflow
        if dropped.is_none() {
            self.available.add_permits(1);
        }
        dropped
    }

    /// Next job, or `None` once the queue is closed
    async fn pop(&self) -> Option<DnsJob> {
        match self.available.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.jobs.lock().pop_front()
            }
            Err(_) => None,
        }
    }

    fn close(&self) {
        self.available.close();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// Shared engine state cloned into spawned tasks (dials, per-flow inbound
/// pumps, DNS workers).
#[derive(Clone)]
struct StackCore {
    socks: SocksConfig,
    mss: usize,
    dns_resolver: Ipv4Addr,
    flows: Arc<FlowTable>,
    dns_pool: Arc<DnsTunnelPool>,
    dns_queue: Arc<DnsQueue>,
    stats: Arc<StackStats>,
    running: Arc<AtomicBool>,
    device_tx: mpsc::Sender<BytesMut>,
    events: Option<mpsc::UnboundedSender<StackEvent>>,
}

impl StackCore {
    fn emit(&self, event: StackEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Queue a frame for the device writer. Best effort; delivery at this
    /// layer is not guaranteed.
    async fn send_frame(&self, frame: Vec<u8>) {
        self.stats.record_sent(frame.len());
        if self.device_tx.send(BytesMut::from(&frame[..])).await.is_err() {
            debug!("device write channel closed, frame dropped");
        }
    }

    /// Emit a segment toward the client: replies travel dst -> src of the key
    async fn send_tcp(&self, key: FlowKey, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) {
        let frame = packet::build_ipv4_tcp(
            *key.dst.ip(),
            *key.src.ip(),
            key.dst.port(),
            key.src.port(),
            seq,
            ack,
            flags,
            DEFAULT_WINDOW,
            payload,
        );
        self.send_frame(frame).await;
    }

    /// Dial the proxy for a freshly seen SYN. On failure nothing is emitted;
    /// the client's connection attempt times out on its own.
    async fn dial_flow(&self, key: FlowKey, client_seq: u32) {
        // Flow destinations go out as domain-typed addresses even when they
        // are literal IPs; the tunnel endpoint accepts either form
        let target = SocksTarget::Domain(key.dst.ip().to_string(), key.dst.port());
        let stream = match socks::dial(&self.socks, &target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("dial for {} failed: {}", key, e);
                self.flows.abort_dial(key);
                self.stats.record_dial_failure();
                self.emit(StackEvent::DialFailed(key));
                return;
            }
        };
        if !self.running.load(Ordering::SeqCst) {
            self.flows.abort_dial(key);
            return;
        }

        let (bridge, inbound) = socks::spawn_relay(stream, &self.socks);
        let flow = TcpFlow::new(key, client_seq, bridge);
        let (seq, ack) = flow.syn_ack();
        let flow = self.flows.insert(flow);
        self.stats.record_flow_opened();
        self.emit(StackEvent::FlowOpened(key));
        self.send_tcp(key, seq, ack, TcpFlags::syn_ack(), &[]).await;
        debug!("flow {} opened, SYN|ACK sent", key);

        let core = self.clone();
        tokio::spawn(async move { core.pump_inbound(key, flow, inbound).await });
    }

    /// Per-flow task turning proxy bytes into PSH|ACK segments, in arrival
    /// order. Chunks larger than the MSS are split so no frame exceeds the
    /// device MTU. Proxy-side EOF ends the task but leaves the flow in the
    /// table; only FIN, RST or shutdown destroy it.
    async fn pump_inbound(
        &self,
        key: FlowKey,
        flow: Arc<Mutex<TcpFlow>>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
    ) {
        while self.running.load(Ordering::Relaxed) {
            let Some(chunk) = inbound.recv().await else {
                break;
            };
            for piece in chunk.chunks(self.mss) {
                let header = flow.lock().on_proxy_data(piece.len());
                match header {
                    Some((seq, ack)) => {
                        self.send_tcp(key, seq, ack, TcpFlags::psh_ack(), piece).await;
                    }
                    // Data before the handshake completes is discarded
                    None => {
                        trace!("{} proxy bytes for {} discarded, flow not established", piece.len(), key);
                    }
                }
            }
        }
        trace!("inbound relay for {} ended", key);
    }

    /// DNS worker: drain the queue, resolve through the pool, answer over UDP
    async fn dns_worker(&self, worker: usize) {
        while let Some(job) = self.dns_queue.pop().await {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            match self.dns_pool.resolve(self.dns_resolver, &job.query).await {
                Ok(response) => {
                    self.stats.record_dns_response();
                    // Source the reply from the packet's original destination
                    // so the client correlates it with its query
                    let frame = packet::build_ipv4_udp(
                        *job.server.ip(),
                        *job.client.ip(),
                        job.server.port(),
                        job.client.port(),
                        &response,
                    );
                    self.send_frame(frame).await;
                }
                Err(e) => {
                    warn!("DNS resolution for {} failed: {}", job.client, e);
                    self.stats.record_dns_failure();
                }
            }
        }
        trace!("DNS worker {} exiting", worker);
    }
}

/// The packet relay engine.
///
/// Construct with [`WarrenStack::builder`], hand it the device write channel
/// with [`set_device_tx`](Self::set_device_tx), then either feed frames
/// through [`process_frame`](Self::process_frame) or let
/// [`run`](Self::run) drive a device handle end to end.
pub struct WarrenStack {
    config: StackConfig,
    flows: Arc<FlowTable>,
    dns_pool: Arc<DnsTunnelPool>,
    dns_queue: Arc<DnsQueue>,
    dial_permits: Arc<Semaphore>,
    stats: Arc<StackStats>,
    running: Arc<AtomicBool>,
    core: Option<StackCore>,
    events: Option<mpsc::UnboundedSender<StackEvent>>,
}

impl WarrenStack {
    pub fn new(config: StackConfig) -> Self {
        let dns_pool = Arc::new(DnsTunnelPool::new(config.socks.clone(), config.dns.clone()));
        Self {
            flows: Arc::new(FlowTable::new()),
            dns_pool,
            dns_queue: Arc::new(DnsQueue::new(config.dns_queue_depth)),
            dial_permits: Arc::new(Semaphore::new(config.dial_concurrency)),
            stats: Arc::new(StackStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            core: None,
            events: None,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StackConfig::default())
    }

    pub fn builder() -> StackBuilder {
        StackBuilder::new()
    }

    /// Set the channel response frames are written to. The receiving end must
    /// be drained by exactly one task holding the device write half.
    pub fn set_device_tx(&mut self, tx: mpsc::Sender<BytesMut>) {
        self.core = Some(StackCore {
            socks: self.config.socks.clone(),
            mss: self.config.mtu.saturating_sub(40).max(536),
            dns_resolver: self.config.dns_resolver,
            flows: self.flows.clone(),
            dns_pool: self.dns_pool.clone(),
            dns_queue: self.dns_queue.clone(),
            stats: self.stats.clone(),
            running: self.running.clone(),
            device_tx: tx,
            events: self.events.clone(),
        });
    }

    pub fn set_event_sink(&mut self, tx: mpsc::UnboundedSender<StackEvent>) {
        self.events = Some(tx.clone());
        if let Some(core) = self.core.as_mut() {
            core.events = Some(tx);
        }
    }

    /// Flip the running flag and spawn the DNS workers. Requires the device
    /// channel to be set.
    pub fn start(&self) -> Result<()> {
        let core = self.core.as_ref().ok_or(StackError::DeviceNotReady)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for worker in 0..self.config.dns_workers {
            let core = core.clone();
            tokio::spawn(async move { core.dns_worker(worker).await });
        }
        core.emit(StackEvent::Started);
        info!(
            "warren stack started ({} dial permits, {} DNS workers)",
            self.config.dial_concurrency, self.config.dns_workers
        );
        Ok(())
    }

    /// Orderly shutdown: wake the workers, disconnect every flow, drain the
    /// DNS pool. In-flight dials observe the flag and abandon their result.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.dns_queue.close();
        for flow in self.flows.drain() {
            let bridge = {
                let mut flow = flow.lock();
                flow.close();
                flow.bridge().clone()
            };
            bridge.disconnect();
            self.stats.record_flow_closed();
        }
        self.dns_pool.drain();
        if let Some(core) = &self.core {
            core.emit(StackEvent::Stopped);
        }
        info!("warren stack stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Drive a device handle until it closes or the stack is stopped. Splits
    /// the handle, spawns the single writer task, and runs the read loop on
    /// the calling task.
    pub async fn run<D>(mut self, device: D) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<BytesMut>(self.config.write_channel_depth);
        self.set_device_tx(tx);
        self.start()?;

        let (mut reader, mut writer) = tokio::io::split(device);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("device write failed: {}", e);
                }
            }
        });

        let mut buf = vec![0u8; packet::READ_BUFFER_SIZE];
        while self.is_running() {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("device closed");
                    break;
                }
                Ok(n) => self.process_frame(&buf[..n]).await,
                Err(e) => {
                    warn!("device read failed: {}", e);
                    break;
                }
            }
        }
        self.stop();
        Ok(())
    }

    /// Parse one raw frame and dispatch it. Malformed frames are counted and
    /// dropped without a response.
    pub async fn process_frame(&self, frame: &[u8]) {
        if !self.is_running() {
            return;
        }
        let Some(core) = self.core.as_ref() else {
            return;
        };
        self.stats.record_received(frame.len());

        let ip = match packet::parse_ipv4(frame) {
            Ok(ip) => ip,
            Err(e) => {
                self.stats.record_invalid();
                debug!("frame dropped: {}", e);
                return;
            }
        };

        match ip.protocol {
            packet::PROTO_TCP => {
                self.stats.record_tcp();
                self.handle_tcp(core, &ip).await;
            }
            packet::PROTO_UDP => {
                self.stats.record_udp();
                self.handle_udp(core, &ip).await;
            }
            packet::PROTO_ICMP => {
                self.stats.record_icmp();
                self.stats.record_dropped();
            }
            proto => {
                self.stats.record_other();
                self.stats.record_dropped();
                trace!("protocol {} dropped", proto);
            }
        }
    }

    async fn handle_tcp(&self, core: &StackCore, ip: &Ipv4Packet) {
        let seg = match packet::parse_tcp(&ip.payload) {
            Ok(seg) => seg,
            Err(e) => {
                self.stats.record_invalid();
                debug!("TCP segment dropped: {}", e);
                return;
            }
        };
        let key = FlowKey::new(
            SocketAddrV4::new(ip.src, seg.src_port),
            SocketAddrV4::new(ip.dst, seg.dst_port),
        );
        trace!(
            "TCP {} seq={} ack={} len={} fin={} syn={} rst={} ack_flag={}",
            key, seg.seq, seg.ack, seg.payload.len(),
            seg.flags.fin, seg.flags.syn, seg.flags.rst, seg.flags.ack,
        );

        if seg.flags.rst {
            self.handle_rst(core, key);
        } else if seg.flags.syn && !seg.flags.ack {
            self.handle_syn(core, key, seg.seq);
        } else if seg.flags.fin {
            self.handle_fin(core, key, seg.seq).await;
        } else if seg.flags.ack {
            self.handle_ack(core, key, seg).await;
        }
    }

    /// New SYN: claim the key and dial on a bounded worker. Duplicate SYNs
    /// for a pending or live key are suppressed.
    fn handle_syn(&self, core: &StackCore, key: FlowKey, client_seq: u32) {
        if !self.flows.begin_dial(key) {
            trace!("duplicate SYN for {} suppressed", key);
            return;
        }
        debug!("SYN for {}, dialing proxy", key);
        let core = core.clone();
        let permits = self.dial_permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            core.dial_flow(key, client_seq).await;
        });
    }

    async fn handle_ack(&self, core: &StackCore, key: FlowKey, seg: TcpSegment) {
        let Some(flow) = self.flows.get(&key) else {
            trace!("segment for unknown flow {} dropped", key);
            self.stats.record_dropped();
            return;
        };
        let (action, bridge) = {
            let mut flow = flow.lock();
            let action = flow.on_ack(seg.seq, seg.ack, seg.payload.len());
            (action, flow.bridge().clone())
        };
        match action {
            FlowAction::Established => {
                debug!("flow {} established", key);
            }
            FlowAction::AckData { seq, ack } => {
                if let Err(e) = bridge.send(seg.payload).await {
                    debug!("payload for {} lost, bridge closed: {}", key, e);
                }
                core.send_tcp(key, seq, ack, TcpFlags::ack_only(), &[]).await;
            }
            FlowAction::None => {}
        }
    }

    async fn handle_fin(&self, core: &StackCore, key: FlowKey, seq: u32) {
        let Some(flow) = self.flows.remove(&key) else {
            return;
        };
        let ((fin_seq, fin_ack), bridge) = {
            let mut flow = flow.lock();
            let reply = flow.on_fin(seq);
            let bridge = flow.bridge().clone();
            flow.close();
            (reply, bridge)
        };
        core.send_tcp(key, fin_seq, fin_ack, TcpFlags::fin_ack(), &[]).await;
        bridge.disconnect();
        self.stats.record_flow_closed();
        core.emit(StackEvent::FlowClosed(key));
        debug!("flow {} closed by FIN", key);
    }

    /// RST tears the flow down without a reply
    fn handle_rst(&self, core: &StackCore, key: FlowKey) {
        if let Some(flow) = self.flows.remove(&key) {
            let bridge = {
                let mut flow = flow.lock();
                flow.close();
                flow.bridge().clone()
            };
            bridge.disconnect();
            self.stats.record_flow_closed();
            core.emit(StackEvent::FlowClosed(key));
            debug!("flow {} reset by client", key);
        }
    }

    async fn handle_udp(&self, core: &StackCore, ip: &Ipv4Packet) {
        let udp = match packet::parse_udp(&ip.payload) {
            Ok(udp) => udp,
            Err(e) => {
                self.stats.record_invalid();
                debug!("UDP datagram dropped: {}", e);
                return;
            }
        };
        if udp.dst_port != DNS_PORT || udp.payload.is_empty() {
            trace!("UDP to {}:{} dropped", ip.dst, udp.dst_port);
            self.stats.record_dropped();
            return;
        }
        self.stats.record_dns_query();

        let job = DnsJob {
            client: SocketAddrV4::new(ip.src, udp.src_port),
            server: SocketAddrV4::new(ip.dst, udp.dst_port),
            query: udp.payload,
        };
        if let Some(dropped) = self.dns_queue.push(job) {
            debug!("DNS queue full, shed oldest query from {}", dropped.client);
            self.stats.record_dns_dropped();
            core.emit(StackEvent::DnsQueryDropped);
        }
    }
}
