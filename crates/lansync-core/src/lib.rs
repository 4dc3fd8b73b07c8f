//! LAN peer discovery and consent-gated data reconciliation.
//!
//! Devices on one network announce themselves over UDP multicast, show
//! up in each other's peer lists, and sync on request: the initiator
//! connects over TCP, the acceptor's user approves or declines, and on
//! mutual confirmation the peers negotiate a set of sync modules that
//! reconcile application data in both directions over the same stream.
//!
//! The crate is UI-agnostic. Everything a frontend needs arrives as a
//! [`SyncEvent`] on a channel, and the one decision it owes the engine
//! (consent) rides back on a oneshot inside the event.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lansync_core::{
//!     events, ArtifactSync, DeviceIdentity, DeviceName, Fingerprint, FsArtifactStore,
//!     Platform, ServiceConfig, SyncService,
//! };
//!
//! # async fn run() -> lansync_core::Result<()> {
//! let identity = DeviceIdentity {
//!     fingerprint: Fingerprint::generate(),
//!     name: DeviceName::new("my-device")?,
//!     platform: Platform::current(),
//! };
//! let store = Arc::new(FsArtifactStore::new("/var/lib/myapp/artifacts")?);
//! let modules = lansync_core::registry_of([
//!     Arc::new(ArtifactSync::new("artifacts", store)) as Arc<dyn lansync_core::SyncModule>,
//! ]);
//!
//! let (events_tx, mut events_rx) = events::channel();
//! let service = SyncService::start(ServiceConfig::default(), identity, modules, events_tx).await?;
//! service.open_browse().await?;
//! while let Some(event) = events_rx.recv().await {
//!     // Render peers, answer consent requests, show progress.
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod orchestrator;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod store;
pub mod wire;

pub use cancel::CancellationToken;
pub use config::{NetConfig, ProtocolConfig};
pub use discovery::{Announcement, BrowseSession};
pub use error::{Result, SyncError};
pub use events::{EventReceiver, EventSender, Localizer, SyncEvent, SyncRequest};
pub use identity::{DeviceIdentity, DeviceName, Fingerprint, PeerRecord, Platform};
pub use orchestrator::{registry_of, ModuleRegistry, SyncContext, SyncModule};
pub use reconcile::{ArtifactSync, ReconcileProgress};
pub use service::{ServiceConfig, SyncService};
pub use session::{ConsentDecision, RejectReason, Role, SessionOutcome};
pub use store::{ArtifactStore, FsArtifactStore};
