//! Synthetic TCP flow state machine and connection table
//!
//! One `TcpFlow` per 4-tuple impersonates the remote endpoint toward the
//! client behind the virtual device: the handshake terminates here and the
//! payload is relayed through the flow's SOCKS5 bridge. There is no
//! retransmission, window management or out-of-order buffering; the device's
//! kernel stack already delivers ordered, non-duplicated segments.

use crate::socks::SocksBridge;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

/// Sequence number our side starts every flow at. The value is arbitrary;
/// nothing on the path checks it.
pub const INITIAL_SEQ: u32 = 1000;

/// One TCP flow per (src ip, src port, dst ip, dst port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// SYN|ACK sent, waiting for the client's ACK
    SynReceived,
    Established,
    /// FIN seen, reply on the wire, bridge teardown in progress
    FinWait,
    Closed,
}

/// What the dispatcher must do after feeding a segment to a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    None,
    /// Handshake completed, no reply needed
    Established,
    /// Forward the segment payload to the bridge, then emit a pure ACK
    AckData { seq: u32, ack: u32 },
}

/// Per-flow TCP state. Created only after the SOCKS5 dial succeeded, so a
/// flow always owns a connected bridge.
pub struct TcpFlow {
    key: FlowKey,
    state: FlowState,
    /// Next sequence number of our synthetic endpoint, monotone (wrapping)
    our_seq: u32,
    /// Next byte we expect from the client
    peer_seq: u32,
    bridge: SocksBridge,
    created_at: Instant,
    bytes_to_proxy: u64,
    bytes_to_client: u64,
}

impl TcpFlow {
    pub fn new(key: FlowKey, client_seq: u32, bridge: SocksBridge) -> Self {
        Self {
            key,
            state: FlowState::SynReceived,
            our_seq: INITIAL_SEQ,
            peer_seq: client_seq.wrapping_add(1),
            bridge,
            created_at: Instant::now(),
            bytes_to_proxy: 0,
            bytes_to_client: 0,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn bridge(&self) -> &SocksBridge {
        &self.bridge
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// (bytes client->proxy, bytes proxy->client)
    pub fn transferred(&self) -> (u64, u64) {
        (self.bytes_to_proxy, self.bytes_to_client)
    }

    /// Header values for the SYN|ACK answering the client's SYN
    pub fn syn_ack(&self) -> (u32, u32) {
        (self.our_seq, self.peer_seq)
    }

    /// Process an ACK segment from the client
    pub fn on_ack(&mut self, seq: u32, ack: u32, payload_len: usize) -> FlowAction {
        match self.state {
            FlowState::SynReceived => {
                if ack == self.our_seq.wrapping_add(1) && payload_len == 0 {
                    // Our SYN consumed one sequence number
                    self.our_seq = self.our_seq.wrapping_add(1);
                    self.state = FlowState::Established;
                    return FlowAction::Established;
                }
                FlowAction::None
            }
            FlowState::Established if payload_len > 0 => {
                self.peer_seq = seq.wrapping_add(payload_len as u32);
                self.bytes_to_proxy += payload_len as u64;
                FlowAction::AckData { seq: self.our_seq, ack: self.peer_seq }
            }
            _ => FlowAction::None,
        }
    }

    /// Process a FIN from the client; returns the FIN|ACK header values.
    /// The caller disconnects the bridge and removes the flow.
    pub fn on_fin(&mut self, seq: u32) -> (u32, u32) {
        self.peer_seq = seq.wrapping_add(1);
        let reply = (self.our_seq, self.peer_seq);
        // Our FIN consumes one sequence number
        self.our_seq = self.our_seq.wrapping_add(1);
        self.state = FlowState::FinWait;
        reply
    }

    /// Header values for a PSH|ACK carrying `len` bytes received from the
    /// proxy. Returns `None` unless the flow is established; data arriving
    /// before the client's final handshake ACK is discarded.
    pub fn on_proxy_data(&mut self, len: usize) -> Option<(u32, u32)> {
        if self.state != FlowState::Established {
            return None;
        }
        let header = (self.our_seq, self.peer_seq);
        self.our_seq = self.our_seq.wrapping_add(len as u32);
        self.bytes_to_client += len as u64;
        Some(header)
    }

    pub fn close(&mut self) {
        self.state = FlowState::Closed;
    }
}

/// Concurrent 4-tuple -> flow mapping with pending-dial markers.
///
/// The marker keeps a second SYN for the same 4-tuple from starting a second
/// dial while the first is still in flight; a flow is inserted only after its
/// dial and SOCKS5 handshake succeeded.
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<Mutex<TcpFlow>>>,
    pending: DashMap<FlowKey, Instant>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Claim the key for a dial. False if a dial is already pending or a
    /// live flow exists.
    pub fn begin_dial(&self, key: FlowKey) -> bool {
        if self.flows.contains_key(&key) {
            return false;
        }
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    /// Drop the pending marker after a failed dial
    pub fn abort_dial(&self, key: FlowKey) {
        self.pending.remove(&key);
    }

    /// Insert a freshly dialed flow, releasing its pending marker
    pub fn insert(&self, flow: TcpFlow) -> Arc<Mutex<TcpFlow>> {
        let key = flow.key();
        let flow = Arc::new(Mutex::new(flow));
        self.flows.insert(key, flow.clone());
        self.pending.remove(&key);
        flow
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Mutex<TcpFlow>>> {
        self.flows.get(key).map(|f| f.value().clone())
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<Mutex<TcpFlow>>> {
        self.flows.remove(key).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Remove everything, returning the flows so the caller can close their
    /// bridges
    pub fn drain(&self) -> Vec<Arc<Mutex<TcpFlow>>> {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, flow)) = self.flows.remove(&key) {
                drained.push(flow);
            }
        }
        self.pending.clear();
        drained
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}
