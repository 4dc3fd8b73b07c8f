//! Module negotiation over an established session.
//!
//! After mutual confirmation the host announces the keys of every sync
//! module it carries, the client answers with the subset it also
//! carries, and each named module then owns the stream for one serial
//! exchange. Unrecognized keys are skipped without ending the session,
//! so peers with different module sets still sync their intersection.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::Result;
use crate::events::EventSender;
use crate::session::{timed_idle, Role};
use crate::wire::{FrameReader, FrameWriter};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Frame reader over an erased stream half, as handed to modules.
pub type StreamReader = FrameReader<BoxedRead>;
/// Frame writer over an erased stream half, as handed to modules.
pub type StreamWriter = FrameWriter<BoxedWrite>;

/// Everything a module needs for its slice of the session.
pub struct SyncContext<'a> {
    pub reader: &'a mut StreamReader,
    pub writer: &'a mut StreamWriter,
    pub role: Role,
    pub events: EventSender,
}

/// One negotiable unit of synchronization, identified by a stable key.
///
/// `exchange` runs on both ends simultaneously and owns the stream until
/// it returns; both sides must leave the stream frame-aligned.
#[async_trait]
pub trait SyncModule: Send + Sync {
    fn key(&self) -> &str;

    async fn exchange(&self, ctx: &mut SyncContext<'_>) -> Result<()>;
}

/// Modules by key, iterated in key order on the host side.
pub type ModuleRegistry = BTreeMap<String, Arc<dyn SyncModule>>;

/// Build a registry from a list of modules.
pub fn registry_of(modules: impl IntoIterator<Item = Arc<dyn SyncModule>>) -> ModuleRegistry {
    modules
        .into_iter()
        .map(|m| (m.key().to_string(), m))
        .collect()
}

/// Run the negotiation for whichever role this context holds.
pub async fn run(modules: &ModuleRegistry, ctx: &mut SyncContext<'_>) -> Result<()> {
    match ctx.role {
        Role::Host => run_host(modules, ctx).await,
        Role::Client => run_client(modules, ctx).await,
    }
}

/// Host side: announce our keys, then serve the client's picks until
/// the empty-key terminator.
async fn run_host(modules: &ModuleRegistry, ctx: &mut SyncContext<'_>) -> Result<()> {
    for key in modules.keys() {
        ctx.writer.write_string(key)?;
    }
    ctx.writer.write_string("")?;
    ctx.writer.flush().await?;

    loop {
        let key = timed_idle("read module key", ctx.reader.read_string()).await?;
        if key.is_empty() {
            return Ok(());
        }
        match modules.get(&key) {
            Some(module) => {
                debug!(module = %key, "Running sync module");
                module.exchange(ctx).await?;
            }
            None => debug!(module = %key, "Skipping unrecognized module key"),
        }
    }
}

/// Client side: read the host's list, then run the modules both sides
/// carry, in the host's announcement order.
async fn run_client(modules: &ModuleRegistry, ctx: &mut SyncContext<'_>) -> Result<()> {
    let mut offered = Vec::new();
    loop {
        let key = timed_idle("read module list", ctx.reader.read_string()).await?;
        if key.is_empty() {
            break;
        }
        offered.push(key);
    }

    for key in offered {
        let Some(module) = modules.get(&key) else {
            debug!(module = %key, "Host offers a module we do not carry");
            continue;
        };
        ctx.writer.write_string(&key)?;
        ctx.writer.flush().await?;
        debug!(module = %key, "Running sync module");
        module.exchange(ctx).await?;
    }
    ctx.writer.write_string("")?;
    ctx.writer.flush().await?;
    Ok(())
}
