//! Session layer: handshake opcodes, rejection reasons, and the
//! single-slot consent gate shared by all inbound connections.

pub mod acceptor;
pub mod initiator;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::NetConfig;
use crate::error::{Result, SyncError};
use crate::wire::{FrameReader, FrameWriter};

/// Generic ack (module channel only).
pub const OP_ACK: u8 = 1;
/// Structured rejection: reason string, optionally a trailing byte.
pub const OP_REJECT: u8 = 2;
/// Sync request from the initiator; also the mutual-confirmation code.
pub const OP_SYNC_REQUEST: u8 = 3;
/// Keepalive, echoed verbatim by the peer.
pub const OP_KEEPALIVE: u8 = 4;

/// Which end of the negotiated session this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the inbound request; announces its module list first.
    Host,
    /// Initiated the request; filters the host's module list.
    Client,
}

/// The user's answer to an inbound sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Accept,
    Reject,
}

/// Terminal state of a session, reported on the event channel.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed,
    RejectedByPeer(RejectReason),
    DeclinedLocally,
    Cancelled,
    TimedOut,
    Fault(String),
}

/// Structured reason attached to an `OP_REJECT` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The peer is not accepting sync requests, or the user declined.
    SyncRejected,
    /// Another inbound session is already pending or active.
    PeerLimit,
    /// The peer saw a protocol code it does not understand.
    UnknownCode(u8),
    /// The initiator cancelled before confirmation.
    Canceled,
    /// A reason string this implementation does not recognize.
    Other(String),
}

impl RejectReason {
    /// The reason string carried on the wire.
    pub fn wire_key(&self) -> &str {
        match self {
            RejectReason::SyncRejected => "sync-rejected",
            RejectReason::PeerLimit => "player-limit",
            RejectReason::UnknownCode(_) => "sync-unknown-code",
            RejectReason::Canceled => "canceled",
            RejectReason::Other(s) => s,
        }
    }

    /// Localization key and arguments for display.
    pub fn message_key(&self) -> (&'static str, Vec<String>) {
        match self {
            RejectReason::SyncRejected => ("sync-rejected", Vec::new()),
            RejectReason::PeerLimit => ("player-limit", Vec::new()),
            RejectReason::UnknownCode(b) => ("sync-unknown-code", vec![b.to_string()]),
            RejectReason::Canceled => ("canceled", Vec::new()),
            RejectReason::Other(s) => ("sync-unknown-reason", vec![s.clone()]),
        }
    }

    /// Write a full `OP_REJECT` frame for this reason.
    pub fn encode<W: AsyncWrite + Unpin>(&self, writer: &mut FrameWriter<W>) -> Result<()> {
        writer.write_u8(OP_REJECT);
        writer.write_string(self.wire_key())?;
        if let RejectReason::UnknownCode(b) = self {
            writer.write_u8(*b);
        }
        Ok(())
    }

    /// Decode the body of an `OP_REJECT` frame (the opcode byte has
    /// already been consumed).
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Self> {
        let key = reader.read_string().await?;
        Ok(match key.as_str() {
            "sync-rejected" => RejectReason::SyncRejected,
            "player-limit" => RejectReason::PeerLimit,
            "canceled" => RejectReason::Canceled,
            "sync-unknown-code" => RejectReason::UnknownCode(reader.read_u8().await?),
            _ => RejectReason::Other(key),
        })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownCode(b) => write!(f, "sync-unknown-code ({})", b),
            other => write!(f, "{}", other.wire_key()),
        }
    }
}

/// Single-slot admission control for inbound sessions.
///
/// At most one acceptor-side session may be pending or active; the slot
/// is held for the session's entire lifetime and released when the
/// permit drops, whatever the terminal path.
#[derive(Debug, Clone)]
pub struct ConsentGate {
    slot: Arc<Semaphore>,
}

impl ConsentGate {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Claim the slot without waiting. `None` means another session is
    /// pending or active.
    pub fn try_acquire(&self) -> Option<ConsentSlot> {
        self.slot.clone().try_acquire_owned().ok().map(ConsentSlot)
    }
}

impl Default for ConsentGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while an inbound session occupies the admission slot.
#[derive(Debug)]
pub struct ConsentSlot(#[allow(dead_code)] OwnedSemaphorePermit);

/// Bound a protocol read by a timeout, mapping expiry to a session
/// timeout error.
pub(crate) async fn timed<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| SyncError::Timeout { operation, after })?
}

/// [`timed`] with the standard idle-read timeout.
pub(crate) async fn timed_idle<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timed(operation, NetConfig::IDLE_TIMEOUT, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_admits_exactly_one() {
        let gate = ConsentGate::new();
        let slot = gate.try_acquire();
        assert!(slot.is_some());
        assert!(gate.try_acquire().is_none());

        drop(slot);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_reject_reason_codec_roundtrip() {
        for reason in [
            RejectReason::SyncRejected,
            RejectReason::PeerLimit,
            RejectReason::UnknownCode(9),
            RejectReason::Canceled,
            RejectReason::Other("server.kicked.playerLimit".to_string()),
        ] {
            let mut bytes = Vec::new();
            let mut w = FrameWriter::new(&mut bytes);
            reason.encode(&mut w).unwrap();
            w.flush().await.unwrap();

            let mut r = FrameReader::new(bytes.as_slice());
            assert_eq!(r.read_u8().await.unwrap(), OP_REJECT);
            assert_eq!(RejectReason::decode(&mut r).await.unwrap(), reason);
        }
    }

    #[test]
    fn test_unknown_code_message_args_carry_the_byte() {
        let (key, args) = RejectReason::UnknownCode(9).message_key();
        assert_eq!(key, "sync-unknown-code");
        assert_eq!(args, vec!["9".to_string()]);
    }
}
