//! The browse session: multicast listener plus peer registry.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::discovery::Announcement;
use crate::error::Result;
use crate::events::{EventSender, SyncEvent};
use crate::identity::{DeviceIdentity, Fingerprint, PeerRecord};
use crate::service::{FaultSlot, ServiceConfig};

/// How the registry reacted to a datagram.
enum Reaction {
    /// A peer we had not seen; it gets a unicast introduction back.
    Found(PeerRecord),
    /// A known peer withdrew.
    Lost(PeerRecord),
}

/// An open stint on the multicast group.
///
/// Opening broadcasts our presence and starts the listener; [`close`]
/// withdraws with an "absent" broadcast. Dropping without closing stops
/// the listener but leaves peers to notice our absence on their own.
///
/// [`close`]: BrowseSession::close
pub struct BrowseSession {
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<HashMap<Fingerprint, PeerRecord>>>,
    identity: DeviceIdentity,
    group: Ipv4Addr,
    port: u16,
    task: JoinHandle<()>,
}

impl BrowseSession {
    pub(crate) async fn open(
        identity: DeviceIdentity,
        config: &ServiceConfig,
        events: EventSender,
        fault: FaultSlot,
    ) -> Result<Self> {
        let socket = Arc::new(bind_multicast(config.multicast_group, config.port)?);
        let registry = Arc::new(Mutex::new(HashMap::new()));

        let hello = Announcement::present(&identity).encode();
        socket
            .send_to(&hello, SocketAddrV4::new(config.multicast_group, config.port))
            .await?;
        info!(group = %config.multicast_group, port = config.port, "Browsing for peers");

        let task = tokio::spawn(listen_loop(
            socket.clone(),
            registry.clone(),
            identity.clone(),
            config.port,
            events,
            fault,
        ));

        Ok(Self {
            socket,
            registry,
            identity,
            group: config.multicast_group,
            port: config.port,
            task,
        })
    }

    /// Snapshot of every peer currently known.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.lock().expect("registry lock").values().cloned().collect()
    }

    /// Stop listening and broadcast our withdrawal.
    pub(crate) async fn close(self) {
        self.task.abort();
        let goodbye = Announcement::absent(&self.identity).encode();
        if let Err(e) = self
            .socket
            .send_to(&goodbye, SocketAddrV4::new(self.group, self.port))
            .await
        {
            warn!(error = %e, "Could not broadcast withdrawal");
        }
    }
}

impl Drop for BrowseSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A UDP socket on the multicast group, address-shared so several
/// instances on one machine can browse at once.
fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<HashMap<Fingerprint, PeerRecord>>>,
    identity: DeviceIdentity,
    port: u16,
    events: EventSender,
    fault: FaultSlot,
) {
    let mut buf = vec![0u8; ProtocolConfig::MAX_DATAGRAM_LEN];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = fault.teardown().cancelled() => return,
        };
        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                fault.record(format!("discovery listener failed: {e}"));
                events
                    .send(SyncEvent::Fault {
                        message: format!("discovery listener failed: {e}"),
                    })
                    .ok();
                return;
            }
        };

        let Some(announcement) = Announcement::decode(&buf[..len]) else {
            continue;
        };
        // Multicast loops our own announcements back; the fingerprint
        // tells them apart from real peers on any interface.
        if *announcement.fingerprint() == identity.fingerprint {
            continue;
        }

        let reaction = {
            let mut registry = registry.lock().expect("registry lock");
            apply(&mut registry, announcement, src.ip())
        };
        match reaction {
            Some(Reaction::Found(peer)) => {
                debug!(peer = %peer.name, addr = %peer.addr, "Peer found");
                // Introduce ourselves back so the newcomer sees us
                // without waiting for our next broadcast.
                let hello = Announcement::present(&identity).encode();
                if let Err(e) = socket.send_to(&hello, SocketAddr::new(src.ip(), port)).await {
                    warn!(error = %e, "Could not answer a new peer");
                }
                events.send(SyncEvent::PeerFound(peer)).ok();
            }
            Some(Reaction::Lost(peer)) => {
                debug!(peer = %peer.name, "Peer withdrew");
                events.send(SyncEvent::PeerLost(peer)).ok();
            }
            None => {}
        }
    }
}

/// Fold one announcement into the registry.
fn apply(
    registry: &mut HashMap<Fingerprint, PeerRecord>,
    announcement: Announcement,
    src: IpAddr,
) -> Option<Reaction> {
    match announcement {
        Announcement::Present {
            fingerprint,
            platform,
            name,
        } => {
            let record = PeerRecord {
                fingerprint,
                platform,
                name,
                addr: src,
            };
            match registry.insert(fingerprint, record.clone()) {
                // Re-announcements refresh the record silently.
                Some(_) => None,
                None => Some(Reaction::Found(record)),
            }
        }
        Announcement::Absent { fingerprint } => {
            registry.remove(&fingerprint).map(Reaction::Lost)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceName, Platform};

    fn present(fp: u8, name: &str) -> Announcement {
        Announcement::Present {
            fingerprint: Fingerprint::from_bytes([fp; 16]),
            platform: Platform::Desktop,
            name: DeviceName::new(name).unwrap(),
        }
    }

    fn absent(fp: u8) -> Announcement {
        Announcement::Absent {
            fingerprint: Fingerprint::from_bytes([fp; 16]),
        }
    }

    const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));

    #[test]
    fn test_new_peer_is_found_once() {
        let mut registry = HashMap::new();
        assert!(matches!(
            apply(&mut registry, present(1, "dev"), SRC),
            Some(Reaction::Found(_))
        ));
        assert!(apply(&mut registry, present(1, "dev"), SRC).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reannouncement_refreshes_the_record() {
        let mut registry = HashMap::new();
        apply(&mut registry, present(1, "before"), SRC);
        apply(&mut registry, present(1, "after"), SRC);

        let record = registry.values().next().unwrap();
        assert_eq!(record.name.as_str(), "after");
    }

    #[test]
    fn test_withdrawal_removes_only_known_peers() {
        let mut registry = HashMap::new();
        assert!(apply(&mut registry, absent(1), SRC).is_none());

        apply(&mut registry, present(1, "dev"), SRC);
        assert!(matches!(
            apply(&mut registry, absent(1), SRC),
            Some(Reaction::Lost(_))
        ));
        assert!(registry.is_empty());
    }
}
