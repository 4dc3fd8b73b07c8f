//! Centralized configuration for the LAN sync engine.
//!
//! Protocol constants are fixed by the wire format; timing and buffer
//! parameters can be tuned here without touching protocol code.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Wire-format constants shared by every peer.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// 16-byte magic prefix of every datagram and TCP preamble.
    pub const MAGIC: [u8; 16] = [
        0x84, 0x36, 0x23, 0x53, 0x9E, 0x5D, 0x30, 0x9B, 0x5D, 0xF8, 0x36, 0x5D, 0x30, 0x36, 0x11,
        0xA4,
    ];
    /// Protocol version, compared byte-for-byte.
    pub const VERSION: [u8; 4] = [0, 0, 0, 0];

    /// Multicast group used for presence announcements.
    pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(230, 0, 0, 0);
    /// Service port, shared by the UDP listener and the TCP acceptor.
    pub const PORT: u16 = 34554;

    /// Maximum payload of a length-prefixed string.
    pub const MAX_STRING_LEN: usize = 255;
    /// Maximum device name length in bytes, post-sanitizing.
    pub const MAX_NAME_LEN: usize = 16;
    /// Largest possible announce datagram: fixed header + 256-byte name.
    pub const MAX_DATAGRAM_LEN: usize = 39 + 256;
}

/// Timing and buffering parameters.
pub struct NetConfig;

impl NetConfig {
    /// Outbound connect timeout, also bounds the preamble exchange.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Idle read timeout once a session is established.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
    /// Keepalive cadence while an acceptor waits on the consent decision.
    pub const CONSENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

    /// Fixed capacity of the write buffer; `flush` is the only point
    /// buffered data leaves the process.
    pub const WRITE_BUF_SIZE: usize = 1024 * 1024;
    /// Read-side buffer capacity.
    pub const READ_BUF_SIZE: usize = 1024 * 1024;
    /// Payload size of a single file chunk frame.
    pub const CHUNK_SIZE: usize = 64 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_fit_the_write_buffer() {
        // A chunk frame (4-byte length + payload) must never overflow
        // the fixed write buffer.
        assert!(NetConfig::CHUNK_SIZE + 4 <= NetConfig::WRITE_BUF_SIZE);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(NetConfig::IDLE_TIMEOUT > NetConfig::CONNECT_TIMEOUT);
        assert!(NetConfig::CONSENT_KEEPALIVE_INTERVAL < NetConfig::IDLE_TIMEOUT);
    }
}
