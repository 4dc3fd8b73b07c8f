//! Acceptor side of the handshake: the TCP listener task and the
//! per-connection state machine that asks the user for consent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NetConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventSender, SyncEvent, SyncRequest};
use crate::identity::{DeviceIdentity, DeviceName, Fingerprint, FINGERPRINT_LEN};
use crate::orchestrator::{self, BoxedRead, BoxedWrite, ModuleRegistry, StreamReader, StreamWriter, SyncContext};
use crate::service::FaultSlot;
use crate::session::{
    timed, timed_idle, ConsentDecision, ConsentGate, RejectReason, Role, SessionOutcome,
    OP_KEEPALIVE, OP_REJECT, OP_SYNC_REQUEST,
};
use crate::wire::{FrameReader, FrameWriter};

/// Everything an inbound connection needs, shared by all of them.
pub(crate) struct AcceptorEnv {
    pub identity: DeviceIdentity,
    pub modules: Arc<ModuleRegistry>,
    pub events: EventSender,
    pub gate: ConsentGate,
    /// Mirrors browse state: requests are only admitted while browsing.
    pub accepting: Arc<AtomicBool>,
}

/// Handle to the running accept loop.
///
/// Dropping the handle aborts the loop; [`shutdown`] stops it cleanly.
///
/// [`shutdown`]: AcceptorHandle::shutdown
pub struct AcceptorHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AcceptorHandle {
    /// The bound listen address (useful when bound to port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the accept loop to stop and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).ok();
        }
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start accepting handshakes on an already-bound listener.
pub(crate) fn start(
    listener: TcpListener,
    env: Arc<AcceptorEnv>,
    fault: FaultSlot,
) -> Result<AcceptorHandle> {
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    info!(device = %env.identity.name, %addr, "Accepting sync requests");
    let task = tokio::spawn(accept_loop(listener, env, fault, shutdown_rx));
    Ok(AcceptorHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn accept_loop(
    listener: TcpListener,
    env: Arc<AcceptorEnv>,
    fault: FaultSlot,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown_rx => {
                debug!("Accept loop shutting down");
                return;
            }
            _ = fault.teardown().cancelled() => {
                debug!("Accept loop torn down after a sibling fault");
                return;
            }
        };
        match accepted {
            Ok((stream, peer)) => {
                let env = env.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, env).await {
                        // One bad connection never takes the listener down.
                        warn!(%peer, error = %e, "Inbound session failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed; listener stopping");
                fault.record(format!("accept loop failed: {e}"));
                env.events
                    .send(SyncEvent::Fault {
                        message: format!("accept loop failed: {e}"),
                    })
                    .ok();
                return;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    env: Arc<AcceptorEnv>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader: StreamReader = FrameReader::new(Box::new(read_half) as BoxedRead);
    let mut writer: StreamWriter = FrameWriter::new(Box::new(write_half) as BoxedWrite);

    let connect = NetConfig::CONNECT_TIMEOUT;
    if !timed("read preamble", connect, reader.preamble_matches()).await? {
        // Not our protocol; drop without a word.
        debug!(%peer, "Preamble mismatch");
        return Ok(());
    }
    let opcode = timed("read request opcode", connect, reader.read_u8()).await?;
    if opcode != OP_SYNC_REQUEST {
        RejectReason::UnknownCode(opcode).encode(&mut writer)?;
        writer.flush().await?;
        return Ok(());
    }
    let fingerprint = Fingerprint::from_bytes(
        timed("read fingerprint", connect, reader.read_array::<FINGERPRINT_LEN>()).await?,
    );
    let raw_name = timed("read device name", connect, reader.read_string()).await?;
    let name = DeviceName::new(&raw_name)?;

    if !env.accepting.load(Ordering::SeqCst) {
        debug!(%peer, "Rejecting request while not browsing");
        RejectReason::SyncRejected.encode(&mut writer)?;
        writer.flush().await?;
        return Ok(());
    }
    // The slot is held until this function returns, whatever the path.
    let Some(_slot) = env.gate.try_acquire() else {
        debug!(%peer, "Rejecting request while another session holds the slot");
        RejectReason::PeerLimit.encode(&mut writer)?;
        writer.flush().await?;
        return Ok(());
    };

    let (respond, mut decision_rx) = oneshot::channel();
    let request = SyncRequest {
        fingerprint,
        name,
        addr: peer,
    };
    info!(%peer, peer_name = %request.name, "Asking for consent");
    if env
        .events
        .send(SyncEvent::ConsentRequested { request, respond })
        .is_err()
    {
        // Nobody is listening for events, so nobody can consent.
        RejectReason::SyncRejected.encode(&mut writer)?;
        writer.flush().await?;
        return Ok(());
    }

    loop {
        match tokio::time::timeout(NetConfig::CONSENT_KEEPALIVE_INTERVAL, &mut decision_rx).await {
            Ok(Ok(ConsentDecision::Accept)) => {
                return confirm_and_run(&env, &mut reader, &mut writer).await;
            }
            // A dropped responder counts as a rejection.
            Ok(Ok(ConsentDecision::Reject)) | Ok(Err(_)) => {
                RejectReason::SyncRejected.encode(&mut writer)?;
                writer.flush().await?;
                end(&env, SessionOutcome::DeclinedLocally);
                return Ok(());
            }
            Err(_) => {
                // Still waiting on the user; make sure the peer is
                // still there.
                writer.write_u8(OP_KEEPALIVE);
                writer.flush().await?;
                let reply = match timed_idle("read keepalive echo", reader.read_u8()).await {
                    Ok(byte) => byte,
                    Err(SyncError::Timeout { .. }) => {
                        debug!(%peer, "Peer went silent while awaiting consent");
                        end(&env, SessionOutcome::TimedOut);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                match reply {
                    OP_KEEPALIVE => continue,
                    OP_REJECT => {
                        // The initiator withdrew; the reason is best
                        // effort, the withdrawal is not. A truncated
                        // reason must not park the slot, so the decode
                        // is bounded like every other read.
                        let reason =
                            timed_idle("read withdrawal reason", RejectReason::decode(&mut reader))
                                .await
                                .unwrap_or(RejectReason::Canceled);
                        debug!(%peer, %reason, "Initiator withdrew while awaiting consent");
                        end(&env, SessionOutcome::Cancelled);
                        return Ok(());
                    }
                    other => {
                        RejectReason::UnknownCode(other).encode(&mut writer)?;
                        writer.flush().await?;
                        end(
                            &env,
                            SessionOutcome::Fault(format!("unknown handshake code: {other}")),
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Consent granted: confirm, await the mutual confirmation, and hand
/// the stream to module negotiation.
async fn confirm_and_run(
    env: &AcceptorEnv,
    reader: &mut StreamReader,
    writer: &mut StreamWriter,
) -> Result<()> {
    writer.write_u8(OP_SYNC_REQUEST);
    writer.flush().await?;

    match timed_idle("read confirmation", reader.read_u8()).await? {
        OP_SYNC_REQUEST => {
            env.events
                .send(SyncEvent::SessionStarted { role: Role::Host })
                .ok();
            let mut ctx = SyncContext {
                reader,
                writer,
                role: Role::Host,
                events: env.events.clone(),
            };
            match orchestrator::run(&env.modules, &mut ctx).await {
                Ok(()) => {
                    end(env, SessionOutcome::Completed);
                    Ok(())
                }
                Err(e) => {
                    end(env, SessionOutcome::Fault(e.to_string()));
                    Err(e)
                }
            }
        }
        OP_REJECT => {
            let reason = timed_idle("read rejection reason", RejectReason::decode(reader)).await?;
            end(env, SessionOutcome::RejectedByPeer(reason));
            Ok(())
        }
        other => {
            RejectReason::UnknownCode(other).encode(writer)?;
            writer.flush().await?;
            end(
                env,
                SessionOutcome::Fault(format!("unknown confirmation code: {other}")),
            );
            Ok(())
        }
    }
}

fn end(env: &AcceptorEnv, outcome: SessionOutcome) {
    env.events
        .send(SyncEvent::SessionEnded {
            role: Role::Host,
            outcome,
        })
        .ok();
}
