//! The engine's public handle: one running service per device.
//!
//! A [`SyncService`] owns the TCP acceptor for the service's lifetime
//! and a [`BrowseSession`] while browsing is open. Inbound requests are
//! only admitted while browsing, matching what the user sees: if the
//! peer list is not on screen, nobody gets to ask.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::info;

use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::discovery::BrowseSession;
use crate::error::Result;
use crate::events::EventSender;
use crate::identity::{DeviceIdentity, PeerRecord};
use crate::orchestrator::ModuleRegistry;
use crate::session::acceptor::{self, AcceptorEnv, AcceptorHandle};
use crate::session::{initiator, ConsentGate, SessionOutcome};

/// Network endpoints for the service. The defaults are the protocol's
/// well-known group and port; tests override them to isolate runs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Port shared by the TCP acceptor and the UDP multicast listener.
    pub port: u16,
    pub multicast_group: Ipv4Addr,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: ProtocolConfig::PORT,
            multicast_group: ProtocolConfig::MULTICAST_GROUP,
        }
    }
}

/// First-fault slot shared by the service's background loops.
///
/// Recording a fault keeps the first message and tears down every loop
/// watching the slot, so a dead listener never leaves its sibling
/// half-alive.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot {
    first: Arc<Mutex<Option<String>>>,
    teardown: CancellationToken,
}

impl FaultSlot {
    pub(crate) fn record(&self, message: impl Into<String>) {
        {
            let mut slot = self.first.lock().expect("fault slot lock");
            if slot.is_none() {
                *slot = Some(message.into());
            }
        }
        self.teardown.cancel();
    }

    /// The first recorded fault, if any loop has died.
    pub fn get(&self) -> Option<String> {
        self.first.lock().expect("fault slot lock").clone()
    }

    pub(crate) fn teardown(&self) -> &CancellationToken {
        &self.teardown
    }
}

/// A running sync engine bound to one device identity.
///
/// Methods take `&self` and are meant to be driven from the single task
/// that owns the event receiver.
pub struct SyncService {
    config: ServiceConfig,
    identity: DeviceIdentity,
    events: EventSender,
    env: Arc<AcceptorEnv>,
    fault: FaultSlot,
    acceptor: AcceptorHandle,
    browse: Mutex<Option<BrowseSession>>,
}

impl SyncService {
    /// Bind the acceptor and start serving inbound handshakes.
    ///
    /// Browsing (and with it, admission of inbound requests) stays off
    /// until [`open_browse`] is called.
    ///
    /// [`open_browse`]: SyncService::open_browse
    pub async fn start(
        config: ServiceConfig,
        identity: DeviceIdentity,
        modules: ModuleRegistry,
        events: EventSender,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))).await?;
        let env = Arc::new(AcceptorEnv {
            identity: identity.clone(),
            modules: Arc::new(modules),
            events: events.clone(),
            gate: ConsentGate::new(),
            accepting: Arc::new(AtomicBool::new(false)),
        });
        let fault = FaultSlot::default();
        let acceptor = acceptor::start(listener, env.clone(), fault.clone())?;
        info!(device = %identity.name, addr = %acceptor.addr(), "Sync service started");
        Ok(Self {
            config,
            identity,
            events,
            env,
            fault,
            acceptor,
            browse: Mutex::new(None),
        })
    }

    /// The acceptor's bound address (resolves a port-0 bind).
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.addr()
    }

    /// Join the multicast group, announce ourselves, and start
    /// admitting inbound requests. A no-op if already browsing.
    pub async fn open_browse(&self) -> Result<()> {
        if self.is_browsing() {
            return Ok(());
        }
        let session = BrowseSession::open(
            self.identity.clone(),
            &self.config,
            self.events.clone(),
            self.fault.clone(),
        )
        .await?;
        *self.browse.lock().expect("browse lock") = Some(session);
        self.env.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Withdraw from the group and stop admitting inbound requests.
    /// Sessions already past admission run to completion.
    pub async fn close_browse(&self) {
        self.env.accepting.store(false, Ordering::SeqCst);
        let session = self.browse.lock().expect("browse lock").take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Toggle admission of inbound requests directly. Browsing manages
    /// this on its own; headless embedders with no peer list on screen
    /// use it to host without joining the multicast group.
    pub fn set_accepting(&self, accepting: bool) {
        self.env.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_browsing(&self) -> bool {
        self.browse.lock().expect("browse lock").is_some()
    }

    /// Peers currently visible, empty when not browsing.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.browse
            .lock()
            .expect("browse lock")
            .as_ref()
            .map(BrowseSession::peers)
            .unwrap_or_default()
    }

    /// The TCP endpoint a discovered peer accepts requests on.
    pub fn peer_addr(&self, peer: &PeerRecord) -> SocketAddr {
        SocketAddr::new(peer.addr, self.config.port)
    }

    /// Request a session with a discovered peer. See [`connect`].
    ///
    /// [`connect`]: SyncService::connect
    pub async fn connect_peer(
        &self,
        peer: &PeerRecord,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        self.connect(self.peer_addr(peer), cancel).await
    }

    /// Request a session with the peer at `addr` and drive it to a
    /// terminal state. Blocks while the peer's user decides; the token
    /// withdraws the request during that wait.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        initiator::initiate(addr, &self.identity, &self.env.modules, self.events.clone(), cancel)
            .await
    }

    /// The first fault that killed a background loop, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.get()
    }

    /// Stop browsing and shut the acceptor down cleanly.
    pub async fn shutdown(self) {
        self.close_browse().await;
        self.acceptor.shutdown().await;
    }
}
