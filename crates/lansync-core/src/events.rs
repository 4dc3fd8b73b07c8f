//! Event channel between network tasks and the UI-owning task.
//!
//! Network workers never touch display state; everything the embedding
//! application needs to render travels as a [`SyncEvent`] over an
//! unbounded channel, and the one decision flowing the other way (the
//! consent answer) rides a oneshot inside the event that asked for it.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};

use crate::identity::{DeviceName, Fingerprint, PeerRecord};
use crate::reconcile::ReconcileProgress;
use crate::session::{ConsentDecision, RejectReason, Role, SessionOutcome};

/// An inbound sync request awaiting the user's decision.
#[derive(Debug)]
pub struct SyncRequest {
    pub fingerprint: Fingerprint,
    pub name: DeviceName,
    pub addr: SocketAddr,
}

/// Everything the engine reports to the embedding application.
#[derive(Debug)]
pub enum SyncEvent {
    /// A peer announced itself on the multicast group.
    PeerFound(PeerRecord),
    /// A known peer withdrew.
    PeerLost(PeerRecord),
    /// An inbound request needs a consent decision. Dropping the
    /// responder counts as a rejection.
    ConsentRequested {
        request: SyncRequest,
        respond: oneshot::Sender<ConsentDecision>,
    },
    /// Mutual confirmation reached; module negotiation begins.
    SessionStarted { role: Role },
    /// The session reached a terminal state.
    SessionEnded { role: Role, outcome: SessionOutcome },
    /// Reconciliation counters for a running module exchange.
    Progress {
        module: String,
        progress: ReconcileProgress,
    },
    /// A received artifact failed local validation/installation. The
    /// wire exchange still succeeded; nothing is retried.
    InstallFailed { name: String, message: String },
    /// A background loop died; its sibling has been torn down.
    Fault { message: String },
}

/// Sending half of the engine's event channel.
pub type EventSender = mpsc::UnboundedSender<SyncEvent>;
/// Receiving half, owned by the UI task.
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Create the event channel pair.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Localization collaborator: resolves a message key (plus arguments)
/// to display text. The engine itself never renders text.
pub trait Localizer: Send + Sync {
    fn resolve(&self, key: &str, args: &[String]) -> String;
}

/// Plain English fallback localizer.
pub struct EnglishLocalizer;

impl Localizer for EnglishLocalizer {
    fn resolve(&self, key: &str, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("?");
        match key {
            "sync-rejected" => "The peer declined the sync request.".to_string(),
            "player-limit" => "The peer is already negotiating another session.".to_string(),
            "canceled" => "The request was cancelled.".to_string(),
            "sync-unknown-code" => format!("The peer sent an unknown protocol code: {}.", arg(0)),
            "sync-unknown-reason" => format!("The peer gave an unknown reason: {}.", arg(0)),
            other => other.to_string(),
        }
    }
}

impl RejectReason {
    /// Render this reason through a localization collaborator.
    pub fn localize(&self, localizer: &dyn Localizer) -> String {
        let (key, args) = self.message_key();
        localizer.resolve(key, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_english_localizer_known_reasons() {
        let l = EnglishLocalizer;
        assert_eq!(
            RejectReason::SyncRejected.localize(&l),
            "The peer declined the sync request."
        );
        assert_eq!(
            RejectReason::UnknownCode(9).localize(&l),
            "The peer sent an unknown protocol code: 9."
        );
        assert_eq!(
            RejectReason::Other("server.kicked.playerLimit".to_string()).localize(&l),
            "The peer gave an unknown reason: server.kicked.playerLimit."
        );
    }
}
