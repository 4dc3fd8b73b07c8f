//! Name-keyed artifact reconciliation, the built-in sync module.
//!
//! Both sides exchange manifests, request what they lack, and serve what
//! the peer lacks, interleaved on one stream. Artifacts are keyed by
//! name only: a name both sides already hold is never re-transferred,
//! so a second run against an unchanged peer moves no payload.
//!
//! Channel codes (distinct from the handshake opcodes): 4 requests a
//! named artifact, 3 delivers one as a chunked payload, 2 answers a
//! request whose artifact is gone, 1 acknowledges a completed delivery.
//! A delivery counts as served only when its ack arrives; a not-found
//! reply counts immediately, since no ack will follow it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::orchestrator::{SyncContext, SyncModule};
use crate::session::timed_idle;
use crate::store::ArtifactStore;

const CODE_ACK: u8 = 1;
const CODE_NOT_FOUND: u8 = 2;
const CODE_DELIVER: u8 = 3;
const CODE_REQUEST: u8 = 4;

/// Counters for a running reconciliation, reported after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileProgress {
    /// Entries in our manifest as sent.
    pub local_manifest: u32,
    /// Entries in the peer's manifest as received.
    pub remote_manifest: u32,
    /// Artifacts we asked for.
    pub wanted_total: u32,
    /// Requests we answered so far (delivery acked or not-found sent).
    pub served: u32,
    /// Requests the peer announced it will send us.
    pub inbound_total: u32,
    /// Of our requests, how many have been resolved.
    pub answered: u32,
}

impl ReconcileProgress {
    /// Both directions have drained.
    pub fn is_complete(&self) -> bool {
        self.answered >= self.wanted_total && self.served >= self.inbound_total
    }
}

/// Reconciles the contents of an [`ArtifactStore`] with the peer's.
pub struct ArtifactSync {
    key: String,
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactSync {
    pub fn new(key: impl Into<String>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            key: key.into(),
            store,
        }
    }

    /// Local names fit to announce. Names too long for a wire string
    /// are skipped rather than aborting the session.
    async fn local_manifest(&self) -> Result<Vec<String>> {
        let mut names = self.store.list_names().await?;
        names.retain(|name| {
            let fits = name.len() <= crate::config::ProtocolConfig::MAX_STRING_LEN;
            if !fits {
                warn!(name = %name, "Skipping artifact whose name exceeds the wire limit");
            }
            fits
        });
        Ok(names)
    }

    /// Which of the peer's names we will request. A zero-byte local
    /// collision is treated as corrupt: deleted, and still wanted.
    async fn compute_wanted(&self, remote: &[String]) -> Result<Vec<String>> {
        let mut wanted = Vec::new();
        for name in remote {
            if !is_safe_name(name) {
                warn!(name = %name, "Rejecting artifact name with a path separator");
                continue;
            }
            match self.store.size_of(name).await? {
                None => wanted.push(name.clone()),
                Some(0) => {
                    self.store.remove(name).await?;
                    wanted.push(name.clone());
                }
                Some(_) => {}
            }
        }
        Ok(wanted)
    }
}

/// Names never address anything outside the store.
fn is_safe_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\')
}

#[async_trait]
impl SyncModule for ArtifactSync {
    fn key(&self) -> &str {
        &self.key
    }

    async fn exchange(&self, ctx: &mut SyncContext<'_>) -> Result<()> {
        let local = self.local_manifest().await?;
        ctx.writer.write_i32(local.len() as i32);
        for name in &local {
            ctx.writer.write_string(name)?;
        }
        ctx.writer.flush().await?;

        let remote_count = timed_idle("read manifest count", ctx.reader.read_i32()).await?;
        if remote_count < 0 {
            return Err(SyncError::transport(format!(
                "negative manifest count: {remote_count}"
            )));
        }
        let mut remote = Vec::with_capacity(remote_count as usize);
        for _ in 0..remote_count {
            remote.push(timed_idle("read manifest entry", ctx.reader.read_string()).await?);
        }

        let wanted = self.compute_wanted(&remote).await?;
        ctx.writer.write_i32(wanted.len() as i32);
        ctx.writer.flush().await?;
        for name in &wanted {
            ctx.writer.write_u8(CODE_REQUEST);
            ctx.writer.write_string(name)?;
            ctx.writer.flush().await?;
        }

        let inbound_total = timed_idle("read request count", ctx.reader.read_i32()).await?;
        if inbound_total < 0 {
            return Err(SyncError::transport(format!(
                "negative request count: {inbound_total}"
            )));
        }

        let mut progress = ReconcileProgress {
            local_manifest: local.len() as u32,
            remote_manifest: remote_count as u32,
            wanted_total: wanted.len() as u32,
            inbound_total: inbound_total as u32,
            ..ReconcileProgress::default()
        };
        self.report(ctx, &progress);

        let mut payload = Vec::new();
        while !progress.is_complete() {
            let code = timed_idle("read artifact channel code", ctx.reader.read_u8()).await?;
            match code {
                CODE_REQUEST => {
                    let name =
                        timed_idle("read requested name", ctx.reader.read_string()).await?;
                    match self.store.read(&name).await? {
                        Some(bytes) => {
                            debug!(name = %name, size = bytes.len(), "Serving artifact");
                            ctx.writer.write_u8(CODE_DELIVER);
                            ctx.writer.write_chunked(&bytes).await?;
                            // Served once the peer acks the delivery.
                        }
                        None => {
                            debug!(name = %name, "Requested artifact is gone");
                            ctx.writer.write_u8(CODE_NOT_FOUND);
                            ctx.writer.flush().await?;
                            progress.served += 1;
                            self.report(ctx, &progress);
                        }
                    }
                }
                CODE_DELIVER => {
                    if let Some(name) = wanted.get(progress.answered as usize) {
                        payload.clear();
                        ctx.reader
                            .read_chunked(Some(&mut payload), Some(NetConfig::IDLE_TIMEOUT))
                            .await?;
                        if let Err(e) = self.store.install(name, &payload).await {
                            warn!(name = %name, error = %e, "Artifact failed to install");
                            ctx.events
                                .send(SyncEvent::InstallFailed {
                                    name: name.clone(),
                                    message: e.to_string(),
                                })
                                .ok();
                            if let Err(e) = self.store.remove(name).await {
                                warn!(name = %name, error = %e, "Cleanup after failed install");
                            }
                        }
                    } else {
                        // Unsolicited delivery. Drain it to stay
                        // frame-aligned, then ack like any other.
                        ctx.reader
                            .read_chunked(None, Some(NetConfig::IDLE_TIMEOUT))
                            .await?;
                    }
                    ctx.writer.write_u8(CODE_ACK);
                    ctx.writer.flush().await?;
                    progress.answered += 1;
                    self.report(ctx, &progress);
                }
                CODE_NOT_FOUND => {
                    if let Some(name) = wanted.get(progress.answered as usize) {
                        debug!(name = %name, "Peer no longer has a requested artifact");
                    }
                    progress.answered += 1;
                    self.report(ctx, &progress);
                }
                CODE_ACK => {
                    progress.served += 1;
                    self.report(ctx, &progress);
                }
                other => {
                    return Err(SyncError::transport(format!(
                        "unexpected artifact channel code: {other}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ArtifactSync {
    fn report(&self, ctx: &SyncContext<'_>, progress: &ReconcileProgress) {
        ctx.events
            .send(SyncEvent::Progress {
                module: self.key.clone(),
                progress: progress.clone(),
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::store::FsArtifactStore;

    fn sync_over(dir: &TempDir) -> ArtifactSync {
        ArtifactSync::new(
            "artifacts",
            Arc::new(FsArtifactStore::new(dir.path()).unwrap()),
        )
    }

    #[test]
    fn test_safe_names() {
        assert!(is_safe_name("plain.msch"));
        assert!(!is_safe_name("../escape"));
        assert!(!is_safe_name("a\\b"));
    }

    #[tokio::test]
    async fn test_wanted_is_what_we_lack() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("have"), b"xx").unwrap();
        let sync = sync_over(&dir);

        let remote = vec!["have".to_string(), "lack".to_string()];
        assert_eq!(sync.compute_wanted(&remote).await.unwrap(), vec!["lack"]);
    }

    #[tokio::test]
    async fn test_zero_byte_collision_is_deleted_and_still_wanted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let sync = sync_over(&dir);

        let wanted = sync.compute_wanted(&["empty".to_string()]).await.unwrap();
        assert_eq!(wanted, vec!["empty"]);
        assert!(!dir.path().join("empty").exists());
    }

    #[tokio::test]
    async fn test_path_separators_are_never_wanted() {
        let dir = TempDir::new().unwrap();
        let sync = sync_over(&dir);

        let remote = vec!["../../etc/passwd".to_string(), "ok".to_string()];
        assert_eq!(sync.compute_wanted(&remote).await.unwrap(), vec!["ok"]);
    }

    /// Announces whatever names it is given; most filesystems refuse
    /// to create a 300-byte filename, so the oversized case needs a
    /// store that merely claims one.
    struct FixedNames(Vec<String>);

    #[async_trait]
    impl ArtifactStore for FixedNames {
        async fn list_names(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }

        async fn size_of(&self, _name: &str) -> Result<Option<u64>> {
            Ok(Some(1))
        }

        async fn read(&self, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn install(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_oversized_names_are_dropped_from_the_manifest() {
        let store = Arc::new(FixedNames(vec!["x".repeat(300), "fits".to_string()]));
        let sync = ArtifactSync::new("artifacts", store);

        assert_eq!(sync.local_manifest().await.unwrap(), vec!["fits"]);
    }
}
