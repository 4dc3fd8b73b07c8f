//! Artifact reconciliation driven over an in-process duplex stream,
//! with both sides running for real.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use lansync_core::events::{self, SyncEvent};
use lansync_core::orchestrator::{BoxedRead, BoxedWrite, SyncContext};
use lansync_core::reconcile::ReconcileProgress;
use lansync_core::wire::{FrameReader, FrameWriter};
use lansync_core::{
    ArtifactStore, ArtifactSync, FsArtifactStore, Result, Role, SyncError, SyncModule,
};

fn store_with(dir: &TempDir, files: &[(&str, &[u8])]) -> Arc<FsArtifactStore> {
    for (name, bytes) in files {
        std::fs::write(dir.path().join(name), bytes).unwrap();
    }
    Arc::new(FsArtifactStore::new(dir.path()).unwrap())
}

/// Run one `ArtifactSync` exchange on both ends of a duplex pipe and
/// return each side's events.
async fn exchange(
    left: Arc<dyn ArtifactStore>,
    right: Arc<dyn ArtifactStore>,
) -> (Vec<SyncEvent>, Vec<SyncEvent>) {
    let (left_stream, right_stream) = tokio::io::duplex(64 * 1024);

    let mut tasks = Vec::new();
    for (stream, store, role) in [
        (left_stream, left, Role::Host),
        (right_stream, right, Role::Client),
    ] {
        tasks.push(tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = FrameReader::new(Box::new(read_half) as BoxedRead);
            let mut writer = FrameWriter::new(Box::new(write_half) as BoxedWrite);
            let (events_tx, mut events_rx) = events::channel();
            let mut ctx = SyncContext {
                reader: &mut reader,
                writer: &mut writer,
                role,
                events: events_tx,
            };
            ArtifactSync::new("artifacts", store)
                .exchange(&mut ctx)
                .await
                .unwrap();
            let mut seen = Vec::new();
            events_rx.close();
            while let Some(event) = events_rx.recv().await {
                seen.push(event);
            }
            seen
        }));
    }
    let right_events = tasks.pop().unwrap().await.unwrap();
    let left_events = tasks.pop().unwrap().await.unwrap();
    (left_events, right_events)
}

fn final_progress(events: &[SyncEvent]) -> &ReconcileProgress {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            SyncEvent::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .expect("at least one progress event")
}

fn names_in(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_both_sides_end_with_the_union() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let left = store_with(&left_dir, &[("x", b"xx"), ("y", b"yy")]);
    let right = store_with(&right_dir, &[("y", b"YY"), ("z", b"zz")]);

    let (left_events, right_events) = exchange(left, right).await;

    assert_eq!(names_in(&left_dir), vec!["x", "y", "z"]);
    assert_eq!(names_in(&right_dir), vec!["x", "y", "z"]);
    // The shared name was never re-transferred.
    assert_eq!(std::fs::read(left_dir.path().join("y")).unwrap(), b"yy");
    assert_eq!(std::fs::read(right_dir.path().join("y")).unwrap(), b"YY");

    for events in [&left_events, &right_events] {
        let progress = final_progress(events);
        assert_eq!(progress.wanted_total, 1);
        assert_eq!(progress.inbound_total, 1);
        assert_eq!(progress.answered, 1);
        assert_eq!(progress.served, 1);
        assert!(progress.is_complete());
    }
}

#[tokio::test]
async fn test_identical_stores_move_nothing() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let left = store_with(&left_dir, &[("same", b"bytes")]);
    let right = store_with(&right_dir, &[("same", b"bytes")]);

    let (left_events, _) = exchange(left, right).await;

    let progress = final_progress(&left_events);
    assert_eq!(progress.wanted_total, 0);
    assert_eq!(progress.inbound_total, 0);
    assert_eq!(progress.answered, 0);
    assert_eq!(progress.served, 0);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let left = store_with(&left_dir, &[("only-left", b"data")]);
    let right = store_with(&right_dir, &[]);

    exchange(left.clone(), right.clone()).await;
    let (left_events, right_events) = exchange(left, right).await;

    for events in [&left_events, &right_events] {
        let progress = final_progress(events);
        assert_eq!(progress.wanted_total, 0);
        assert_eq!(progress.inbound_total, 0);
    }
}

#[tokio::test]
async fn test_large_payload_crosses_many_chunks() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(left_dir.path().join("big"), &payload).unwrap();
    let left = store_with(&left_dir, &[]);
    let right = store_with(&right_dir, &[]);

    exchange(left, right).await;

    assert_eq!(std::fs::read(right_dir.path().join("big")).unwrap(), payload);
}

/// Lists a name it cannot actually produce, forcing the not-found path.
struct GhostingStore {
    inner: Arc<FsArtifactStore>,
    ghost: &'static str,
}

#[async_trait]
impl ArtifactStore for GhostingStore {
    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = self.inner.list_names().await?;
        names.push(self.ghost.to_string());
        names.sort();
        Ok(names)
    }

    async fn size_of(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size_of(name).await
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if name == self.ghost {
            return Ok(None);
        }
        self.inner.read(name).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(name).await
    }

    async fn install(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.inner.install(name, bytes).await
    }
}

#[tokio::test]
async fn test_vanished_artifact_answers_not_found_and_still_completes() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let left = Arc::new(GhostingStore {
        inner: store_with(&left_dir, &[("real", b"rr")]),
        ghost: "gone",
    });
    let right = store_with(&right_dir, &[]);

    let (left_events, right_events) = exchange(left, right.clone()).await;

    // The real artifact arrived; the ghost did not, and was not
    // installed as an empty husk either.
    assert_eq!(names_in(&right_dir), vec!["real"]);

    let left_progress = final_progress(&left_events);
    assert_eq!(left_progress.inbound_total, 2);
    assert_eq!(left_progress.served, 2);
    let right_progress = final_progress(&right_events);
    assert_eq!(right_progress.wanted_total, 2);
    assert_eq!(right_progress.answered, 2);
}

/// Rejects every install, as a validating store would for corrupt data.
struct RejectingStore {
    inner: Arc<FsArtifactStore>,
    rejected: AtomicUsize,
}

#[async_trait]
impl ArtifactStore for RejectingStore {
    async fn list_names(&self) -> Result<Vec<String>> {
        self.inner.list_names().await
    }

    async fn size_of(&self, name: &str) -> Result<Option<u64>> {
        self.inner.size_of(name).await
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.read(name).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(name).await
    }

    async fn install(&self, name: &str, _bytes: &[u8]) -> Result<()> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::Validation {
            field: "artifact".to_string(),
            message: format!("{name} failed validation"),
        })
    }
}

#[tokio::test]
async fn test_failed_install_is_reported_but_does_not_derail_the_exchange() {
    let (left_dir, right_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let left = store_with(&left_dir, &[("bad", b"bb"), ("worse", b"ww")]);
    let right = Arc::new(RejectingStore {
        inner: store_with(&right_dir, &[]),
        rejected: AtomicUsize::new(0),
    });

    let (left_events, right_events) = exchange(left, right.clone()).await;

    assert_eq!(right.rejected.load(Ordering::SeqCst), 2);
    let failures: Vec<_> = right_events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::InstallFailed { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec!["bad", "worse"]);

    // The wire exchange itself still balanced out.
    assert_eq!(final_progress(&left_events).served, 2);
    assert_eq!(final_progress(&right_events).answered, 2);
    assert_eq!(names_in(&right_dir), Vec::<String>::new());
}
