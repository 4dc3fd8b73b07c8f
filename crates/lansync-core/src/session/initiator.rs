//! Initiator side of the handshake: connect, request, hold through the
//! consent wait, confirm or withdraw.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::config::NetConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventSender, SyncEvent};
use crate::identity::DeviceIdentity;
use crate::orchestrator::{self, BoxedRead, BoxedWrite, ModuleRegistry, StreamReader, StreamWriter, SyncContext};
use crate::session::{
    timed_idle, RejectReason, Role, SessionOutcome, OP_KEEPALIVE, OP_REJECT, OP_SYNC_REQUEST,
};
use crate::wire::{FrameReader, FrameWriter};

/// Connect to a peer and drive a session to completion as the client.
///
/// Blocks for as long as the peer's user takes to decide, answering
/// keepalives. The token withdraws the request while it is still
/// pending; a confirmation already in flight wins over a concurrent
/// cancellation, because the host has committed by then.
pub(crate) async fn initiate(
    addr: SocketAddr,
    identity: &DeviceIdentity,
    modules: &ModuleRegistry,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<SessionOutcome> {
    let connect = NetConfig::CONNECT_TIMEOUT;
    let stream = tokio::time::timeout(connect, TcpStream::connect(addr))
        .await
        .map_err(|_| SyncError::Timeout {
            operation: "connect",
            after: connect,
        })??;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader: StreamReader = FrameReader::new(Box::new(read_half) as BoxedRead);
    let mut writer: StreamWriter = FrameWriter::new(Box::new(write_half) as BoxedWrite);

    writer.write_bytes(&crate::config::ProtocolConfig::MAGIC);
    writer.write_bytes(&crate::config::ProtocolConfig::VERSION);
    writer.write_u8(OP_SYNC_REQUEST);
    writer.write_bytes(identity.fingerprint.as_bytes());
    writer.write_string(identity.name.as_str())?;
    writer.flush().await?;
    info!(%addr, "Sync request sent; awaiting the peer's consent");

    loop {
        let read = tokio::select! {
            // Read first: a confirmation already on the wire beats a
            // simultaneous cancel request.
            biased;
            read = timed_idle("read handshake reply", reader.read_u8()) => Some(read),
            _ = cancel.cancelled() => None,
        };
        let Some(read) = read else {
            debug!(%addr, "Withdrawing the pending request");
            RejectReason::Canceled.encode(&mut writer)?;
            writer.shutdown().await?;
            events
                .send(SyncEvent::SessionEnded {
                    role: Role::Client,
                    outcome: SessionOutcome::Cancelled,
                })
                .ok();
            return Err(SyncError::Cancelled);
        };
        match read? {
            OP_KEEPALIVE => {
                writer.write_u8(OP_KEEPALIVE);
                writer.flush().await?;
            }
            OP_SYNC_REQUEST => {
                writer.write_u8(OP_SYNC_REQUEST);
                writer.flush().await?;
                events
                    .send(SyncEvent::SessionStarted { role: Role::Client })
                    .ok();
                let mut ctx = SyncContext {
                    reader: &mut reader,
                    writer: &mut writer,
                    role: Role::Client,
                    events: events.clone(),
                };
                return match orchestrator::run(modules, &mut ctx).await {
                    Ok(()) => {
                        events
                            .send(SyncEvent::SessionEnded {
                                role: Role::Client,
                                outcome: SessionOutcome::Completed,
                            })
                            .ok();
                        Ok(SessionOutcome::Completed)
                    }
                    Err(e) => {
                        events
                            .send(SyncEvent::SessionEnded {
                                role: Role::Client,
                                outcome: SessionOutcome::Fault(e.to_string()),
                            })
                            .ok();
                        Err(e)
                    }
                };
            }
            OP_REJECT => {
                let reason =
                    timed_idle("read rejection reason", RejectReason::decode(&mut reader)).await?;
                events
                    .send(SyncEvent::SessionEnded {
                        role: Role::Client,
                        outcome: SessionOutcome::RejectedByPeer(reason.clone()),
                    })
                    .ok();
                return Err(SyncError::Rejected(reason));
            }
            other => {
                RejectReason::UnknownCode(other).encode(&mut writer)?;
                writer.flush().await?;
                events
                    .send(SyncEvent::SessionEnded {
                        role: Role::Client,
                        outcome: SessionOutcome::Fault(format!("unknown handshake code: {other}")),
                    })
                    .ok();
                return Err(SyncError::UnknownCode(other));
            }
        }
    }
}
