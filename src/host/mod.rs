//! Rendering host that mirrors registry snapshots onto a surface
//!
//! The host is the consumer side of the registry:
//! - mounts the payload of every open record, with its overlay context
//! - unmounts records that are no longer open (or were replaced)
//! - starts the close sequence of every record that was asked to close
//! - optionally drops records whose overlay has fully closed

pub mod transition;

pub use transition::{ExitTransition, TransitionState};

use crate::overlay::{OverlayContext, OverlayRegistry, OverlayResult, SlotId, Snapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Where overlay payloads are actually shown
#[async_trait]
pub trait Surface<P>: Send
where
    P: Send + Sync + 'static,
{
    /// Show `payload`; `context` gives the payload access to its overlay
    async fn mount(&mut self, slot: SlotId, payload: Arc<P>, context: OverlayContext) -> anyhow::Result<()>;

    /// Stop showing whatever is mounted in `slot`
    async fn unmount(&mut self, slot: SlotId) -> anyhow::Result<()>;
}

/// Drives a [`Surface`] from the snapshots of an [`OverlayRegistry`]
pub struct OverlayHost<P, S> {
    registry: OverlayRegistry<P>,
    surface: S,
    updates: watch::Receiver<Snapshot<P>>,

    /// Generation currently mounted per slot
    mounted: HashMap<SlotId, u64>,

    /// Drop fully closed records after each pass
    prune_closed: bool,
}

impl<P, S> OverlayHost<P, S>
where
    P: Send + Sync + 'static,
    S: Surface<P>,
{
    /// Create a host for `registry` rendering onto `surface`
    pub fn new(registry: OverlayRegistry<P>, surface: S) -> Self {
        let updates = registry.subscribe();
        Self {
            registry,
            surface,
            updates,
            mounted: HashMap::new(),
            prune_closed: false,
        }
    }

    /// Enable or disable pruning of closed records
    pub fn set_prune_closed(&mut self, enabled: bool) {
        self.prune_closed = enabled;
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    /// Slots currently mounted on the surface
    pub fn mounted_slots(&self) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = self.mounted.keys().copied().collect();
        slots.sort();
        slots
    }

    /// Bring the surface in line with the registry's current snapshot
    pub async fn reconcile(&mut self) -> OverlayResult<()> {
        let snapshot = self.updates.borrow_and_update().clone();

        let stale: Vec<SlotId> = self
            .mounted
            .iter()
            .filter(|(slot, generation)| {
                snapshot
                    .get(**slot)
                    .map_or(true, |record| !record.is_open() || record.generation() != **generation)
            })
            .map(|(slot, _)| *slot)
            .collect();

        for slot in stale {
            self.mounted.remove(&slot);
            debug!(%slot, "Unmounting overlay");
            self.surface.unmount(slot).await?;
        }

        let fresh: Vec<_> = snapshot
            .mounted()
            .filter(|record| self.mounted.get(&record.slot()) != Some(&record.generation()))
            .cloned()
            .collect();

        for record in fresh {
            debug!(slot = %record.slot(), generation = record.generation(), "Mounting overlay");
            let context = OverlayContext::for_overlay(record.overlay().clone());
            self.surface
                .mount(record.slot(), Arc::clone(record.payload()), context)
                .await?;
            self.mounted.insert(record.slot(), record.generation());
        }

        for record in snapshot.pending_closes() {
            let slot = record.slot();
            let closing = record.overlay().dismiss();
            tokio::spawn(async move {
                if let Err(e) = closing.await {
                    warn!(%slot, "Overlay closed with errors: {}", e);
                }
            });
        }

        if self.prune_closed {
            self.registry.prune_closed();
        }

        Ok(())
    }

    /// Reconcile on every registry change until `shutdown` resolves
    ///
    /// Returns the surface so callers can inspect or reuse it.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> OverlayResult<S> {
        tokio::pin!(shutdown);

        self.reconcile().await?;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = self.updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile().await?;
                }
            }
        }

        debug!("Overlay host stopped");
        Ok(self.surface)
    }
}
