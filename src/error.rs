//! Error types for the Warren relay stack

use std::io;
use thiserror::Error;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the relay stack
#[derive(Error, Debug)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("proxy connect failed: {0}")]
    ProxyConnect(String),

    #[error("unexpected SOCKS version: {0:#04x}")]
    ProxyVersion(u8),

    #[error("no acceptable auth method (server selected {0:#04x})")]
    ProxyAuthMethod(u8),

    #[error("proxy authentication failed")]
    ProxyAuthFailed,

    #[error("CONNECT rejected by proxy: status {0}")]
    ProxyConnectRejected(u8),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("device not ready")]
    DeviceNotReady,

    #[error("channel closed")]
    ChannelClosed,
}

impl StackError {
    /// True for failures of the proxy dial path (connect, handshake, auth,
    /// CONNECT) as opposed to failures on an already-relaying stream.
    pub fn is_dial_error(&self) -> bool {
        matches!(
            self,
            StackError::ProxyConnect(_)
                | StackError::ProxyVersion(_)
                | StackError::ProxyAuthMethod(_)
                | StackError::ProxyAuthFailed
                | StackError::ProxyConnectRejected(_)
        )
    }
}
