//! Warren stack - user-space packet relay core for a covert tunnel client
//!
//! Converts raw IP traffic from a virtual network device into byte-stream
//! connections relayed through a locally-listening SOCKS5 endpoint (fed by a
//! covert DNS or QUIC-over-DNS transport operated externally). TCP handshakes
//! terminate here: a synthetic per-flow state machine impersonates the remote
//! endpoint toward the client while payload travels over the proxy. DNS
//! queries are intercepted and answered over pooled DNS-over-TCP connections
//! through the same proxy.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------------+
//! |                      WarrenStack                           |
//! |  reader task -> packet codec -> demux                      |
//! |       TCP(6)  -> FlowTable -> SocksBridge --+              |
//! |       UDP(17) :53 -> DnsQueue -> DnsPool ---+--> SOCKS5    |
//! |       other   -> dropped                    |    endpoint  |
//! |  response frames -> single writer task -> device           |
//! +------------------------------------------------------------+
//! ```
//!
//! There is deliberately no retransmission, window management or out-of-order
//! handling: the virtual device's kernel stack already delivers ordered,
//! non-duplicated segments, so the flow machine only keeps sequence
//! bookkeeping.
//!
//! # Example
//!
//! ```rust,ignore
//! use warren_stack::{StackBuilder, WarrenStack};
//! use std::net::Ipv4Addr;
//!
//! #[tokio::main]
//! async fn main() -> warren_stack::Result<()> {
//!     warren_stack::logging::init();
//!
//!     let stack = WarrenStack::builder()
//!         .proxy_addr(([127, 0, 0, 1], 7000).into())
//!         .dns_resolver(Ipv4Addr::new(8, 8, 8, 8))
//!         .build();
//!
//!     let device = open_tun_device()?; // platform collaborator
//!     stack.run(device).await
//! }
//! ```

pub mod dns;
pub mod error;
pub mod logging;
pub mod packet;
pub mod socks;
pub mod stack;
pub mod stats;
pub mod tcp;

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use dns::{DnsPoolConfig, DnsTunnelPool};
pub use error::{Result, StackError};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, checksum, parse_ipv4, parse_tcp, parse_udp, Ipv4Packet,
    TcpFlags, TcpSegment, UdpDatagram,
};
pub use socks::{SocksBridge, SocksConfig, SocksTarget};
pub use stack::{StackBuilder, StackConfig, StackEvent, WarrenStack};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::{FlowKey, FlowState, FlowTable, TcpFlow};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{Result, StackError};
    pub use crate::stack::{StackBuilder, StackConfig, StackEvent, WarrenStack};
    pub use crate::stats::StackStats;
}
