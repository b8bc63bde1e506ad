//! Registry of overlay records, the single source of truth for what is shown
//!
//! The record map is never mutated in place: every change builds a new map,
//! wraps it in a fresh [`Snapshot`] and publishes it through a watch channel.
//! Readers holding an older snapshot keep a consistent view.

use super::controller::OverlayController;
use super::ids::{HandleAllocator, HookIdAllocator, SlotId};
use super::lock;
use super::overlay_ref::OverlayRef;
use super::types::{HookFailures, OverlayError, OverlayEvent, OverlayPhase, OverlayResult};
use futures::future::{self, BoxFuture};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Shared, cheaply cloneable overlay registry
pub struct OverlayRegistry<P> {
    inner: Arc<RegistryInner<P>>,
}

struct RegistryInner<P> {
    /// Current record map
    records: watch::Sender<Snapshot<P>>,

    slots: HandleAllocator,

    /// Hook ids are unique across every overlay of this registry
    hook_ids: HookIdAllocator,

    generations: AtomicU64,

    event_sender: Mutex<Option<mpsc::UnboundedSender<OverlayEvent>>>,
}

/// One registry slot and the overlay currently occupying it
pub struct OverlayRecord<P> {
    slot: SlotId,
    generation: u64,
    is_open: bool,
    payload: Arc<P>,
    overlay: AnyOverlayRef,
}

/// Immutable view of the record map at one point in time
pub struct Snapshot<P> {
    version: u64,
    records: Arc<BTreeMap<SlotId, OverlayRecord<P>>>,
}

impl<P> Clone for OverlayRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Clone for OverlayRecord<P> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            generation: self.generation,
            is_open: self.is_open,
            payload: Arc::clone(&self.payload),
            overlay: self.overlay.clone(),
        }
    }
}

impl<P> Clone for Snapshot<P> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            records: Arc::clone(&self.records),
        }
    }
}

impl<P> std::fmt::Debug for OverlayRecord<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayRecord")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("is_open", &self.is_open)
            .field("overlay", &self.overlay)
            .finish()
    }
}

impl<P> std::fmt::Debug for Snapshot<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("records", &self.records.values().collect::<Vec<_>>())
            .finish()
    }
}

impl<P> OverlayRecord<P> {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Distinguishes successive overlays opened on the same slot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn payload(&self) -> &Arc<P> {
        &self.payload
    }

    pub fn overlay(&self) -> &AnyOverlayRef {
        &self.overlay
    }

    /// Asked to close, but the overlay has not started its close sequence
    pub fn is_pending_close(&self) -> bool {
        !self.is_open && self.overlay.phase() == OverlayPhase::Open
    }
}

impl<P> Snapshot<P> {
    fn empty() -> Self {
        Self {
            version: 0,
            records: Arc::new(BTreeMap::new()),
        }
    }

    fn next(&self, records: BTreeMap<SlotId, OverlayRecord<P>>) -> Self {
        Self {
            version: self.version + 1,
            records: Arc::new(records),
        }
    }

    /// Incremented on every published change
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, slot: SlotId) -> Option<&OverlayRecord<P>> {
        self.records.get(&slot)
    }

    pub fn records(&self) -> impl Iterator<Item = &OverlayRecord<P>> {
        self.records.values()
    }

    /// Records whose payload should be on screen
    pub fn mounted(&self) -> impl Iterator<Item = &OverlayRecord<P>> {
        self.records.values().filter(|record| record.is_open)
    }

    /// Records whose close was requested but whose overlay has not begun closing
    pub fn pending_closes(&self) -> impl Iterator<Item = &OverlayRecord<P>> {
        self.records.values().filter(|record| record.is_pending_close())
    }

    pub fn is_any_open(&self) -> bool {
        self.records.values().any(|record| record.is_open)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<P> OverlayRegistry<P>
where
    P: Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        let (records, _) = watch::channel(Snapshot::empty());

        Self {
            inner: Arc::new(RegistryInner {
                records,
                slots: HandleAllocator::new(),
                hook_ids: HookIdAllocator::new(),
                generations: AtomicU64::new(0),
                event_sender: Mutex::new(None),
            }),
        }
    }

    /// Set the channel receiving lifecycle events
    pub fn set_event_sender(&self, sender: mpsc::UnboundedSender<OverlayEvent>) {
        *lock(&self.inner.event_sender) = Some(sender);
    }

    /// Reserve a fresh slot identifier
    pub fn allocate_slot(&self) -> SlotId {
        self.inner.slots.generate()
    }

    /// Create a controller bound to a freshly allocated slot
    pub fn controller<R>(&self) -> OverlayController<P, R>
    where
        R: Clone + Send + Sync + 'static,
    {
        OverlayController::new(self.clone())
    }

    /// Open `payload` in `slot`, replacing whatever occupied it
    ///
    /// A previous occupant that has not begun closing is abandoned: it is
    /// marked closed without running its hooks and its completion resolves
    /// with `None`.
    pub fn open<R>(&self, slot: SlotId, payload: P) -> OverlayRef<R>
    where
        R: Clone + Send + Sync + 'static,
    {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let overlay = OverlayRef::unattached(self.inner.hook_ids.clone());
        let registry = Arc::downgrade(&self.inner);
        overlay.attach(move || {
            if let Some(registry) = registry.upgrade() {
                registry.overlay_closed(slot, generation);
            }
        });

        let record = OverlayRecord {
            slot,
            generation,
            is_open: true,
            payload: Arc::new(payload),
            overlay: AnyOverlayRef::from(overlay.clone()),
        };

        let mut replaced = None;
        self.inner.records.send_modify(|snapshot| {
            let mut records = (*snapshot.records).clone();
            replaced = records.insert(slot, record);
            *snapshot = snapshot.next(records);
        });

        if let Some(previous) = replaced {
            debug!(%slot, generation = previous.generation, "Replacing overlay");
            previous.overlay.abandon();
            self.inner.send_event(OverlayEvent::Replaced {
                slot,
                generation: previous.generation,
            });
        }

        debug!(%slot, generation, "Overlay opened");
        self.inner.send_event(OverlayEvent::Opened { slot, generation });

        overlay
    }

    /// Ask the overlay in `slot` to close
    ///
    /// Only flips the record to not-open; the overlay's close sequence is
    /// started by whoever reconciles the snapshot.
    pub fn close(&self, slot: SlotId) {
        match self.inner.mark_closed(slot, None) {
            Some(generation) => {
                debug!(%slot, generation, "Overlay close requested");
                self.inner
                    .send_event(OverlayEvent::CloseRequested { slot, generation });
            }
            None => trace!(%slot, "Close requested for a slot with no open overlay"),
        }
    }

    /// Drop the record in `slot`, abandoning its overlay if it never closed
    pub fn remove(&self, slot: SlotId) -> bool {
        let mut removed = None;
        self.inner.records.send_if_modified(|snapshot| {
            if !snapshot.records.contains_key(&slot) {
                return false;
            }
            let mut records = (*snapshot.records).clone();
            removed = records.remove(&slot);
            *snapshot = snapshot.next(records);
            true
        });

        match removed {
            Some(record) => {
                record.overlay.abandon();
                self.inner.send_event(OverlayEvent::Removed {
                    slot,
                    generation: record.generation,
                });
                true
            }
            None => false,
        }
    }

    /// Drop every record whose overlay has fully closed
    pub fn prune_closed(&self) -> usize {
        let mut pruned = Vec::new();
        self.inner.records.send_if_modified(|snapshot| {
            let (closed, kept): (Vec<_>, Vec<_>) = snapshot
                .records
                .iter()
                .map(|(slot, record)| (*slot, record.clone()))
                .partition(|(_, record)| !record.is_open && record.overlay.is_closed());
            if closed.is_empty() {
                return false;
            }
            pruned = closed;
            *snapshot = snapshot.next(kept.into_iter().collect());
            true
        });

        for (slot, record) in &pruned {
            self.inner.send_event(OverlayEvent::Removed {
                slot: *slot,
                generation: record.generation,
            });
        }
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned closed overlays");
        }
        pruned.len()
    }

    /// Current record map
    pub fn snapshot(&self) -> Snapshot<P> {
        self.inner.records.borrow().clone()
    }

    /// Get the record in `slot`, if any
    pub fn record(&self, slot: SlotId) -> Option<OverlayRecord<P>> {
        self.inner.records.borrow().get(slot).cloned()
    }

    /// Receive every future snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<P>> {
        self.inner.records.subscribe()
    }

    /// Whether at least one overlay is open
    pub fn is_any_open(&self) -> bool {
        self.inner.records.borrow().is_any_open()
    }

    /// Start the close sequence of every pending record and wait for all
    ///
    /// This is the snapshot-to-barrier conversion for consumers that do not
    /// run an [`OverlayHost`](crate::host::OverlayHost). Hook failures from
    /// all overlays are merged into one error.
    pub async fn settle_pending(&self) -> OverlayResult<()> {
        let closes: Vec<_> = self
            .snapshot()
            .pending_closes()
            .map(|record| record.overlay.dismiss())
            .collect();

        let mut failures: Option<HookFailures> = None;
        for outcome in future::join_all(closes).await {
            match outcome {
                Ok(()) => {}
                Err(OverlayError::BeforeClose(failed)) => match failures.as_mut() {
                    Some(all) => all.extend(failed),
                    None => failures = Some(failed),
                },
                Err(error) => return Err(error),
            }
        }

        match failures {
            Some(failures) => Err(failures.into()),
            None => Ok(()),
        }
    }
}

impl<P> Default for OverlayRegistry<P>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> RegistryInner<P> {
    /// Flip an open record to not-open, optionally only for one generation
    fn mark_closed(&self, slot: SlotId, generation: Option<u64>) -> Option<u64> {
        let mut closed = None;
        self.records.send_if_modified(|snapshot| {
            let Some(record) = snapshot.records.get(&slot) else {
                return false;
            };
            if !record.is_open || generation.is_some_and(|g| g != record.generation) {
                return false;
            }

            let mut records = (*snapshot.records).clone();
            if let Some(record) = records.get_mut(&slot) {
                record.is_open = false;
                closed = Some(record.generation);
            }
            *snapshot = snapshot.next(records);
            true
        });
        closed
    }

    /// Close callback of the overlay opened as `generation` in `slot`
    fn overlay_closed(&self, slot: SlotId, generation: u64) {
        self.mark_closed(slot, Some(generation));
        debug!(%slot, generation, "Overlay closed");
        self.send_event(OverlayEvent::Closed { slot, generation });
    }

    fn send_event(&self, event: OverlayEvent) {
        if let Some(sender) = lock(&self.event_sender).as_ref() {
            let _ = sender.send(event);
        }
    }
}

/// Type-erased overlay handle stored in registry records
#[derive(Clone)]
pub struct AnyOverlayRef(Arc<dyn ErasedOverlay>);

trait ErasedOverlay: Send + Sync + 'static {
    fn phase(&self) -> OverlayPhase;
    fn dismiss(&self) -> BoxFuture<'static, OverlayResult<()>>;
    fn abandon(&self);
    fn result_type(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<R> ErasedOverlay for OverlayRef<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn phase(&self) -> OverlayPhase {
        OverlayRef::phase(self)
    }

    fn dismiss(&self) -> BoxFuture<'static, OverlayResult<()>> {
        self.close(None)
    }

    fn abandon(&self) {
        OverlayRef::abandon(self)
    }

    fn result_type(&self) -> &'static str {
        std::any::type_name::<R>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AnyOverlayRef {
    pub fn phase(&self) -> OverlayPhase {
        self.0.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.phase().is_closed()
    }

    /// Close the overlay without a result
    pub fn dismiss(&self) -> BoxFuture<'static, OverlayResult<()>> {
        self.0.dismiss()
    }

    /// Name of the result type the overlay produces
    pub fn result_type(&self) -> &'static str {
        self.0.result_type()
    }

    /// Recover the typed handle, if the overlay produces `R`
    pub fn downcast<R>(&self) -> Option<OverlayRef<R>>
    where
        R: Clone + Send + Sync + 'static,
    {
        self.0.as_any().downcast_ref::<OverlayRef<R>>().cloned()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn abandon(&self) {
        self.0.abandon()
    }
}

impl<R> From<OverlayRef<R>> for AnyOverlayRef
where
    R: Clone + Send + Sync + 'static,
{
    fn from(overlay: OverlayRef<R>) -> Self {
        Self(Arc::new(overlay))
    }
}

impl std::fmt::Debug for AnyOverlayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyOverlayRef")
            .field("phase", &self.phase())
            .field("result_type", &self.result_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn registry() -> OverlayRegistry<&'static str> {
        OverlayRegistry::new()
    }

    #[tokio::test]
    async fn test_open_inserts_open_record() {
        let registry = registry();
        let slot = registry.allocate_slot();

        let overlay = registry.open::<String>(slot, "greeting");

        let snapshot = registry.snapshot();
        let record = snapshot.get(slot).unwrap();
        assert!(record.is_open());
        assert_eq!(**record.payload(), "greeting");
        assert!(record.overlay().downcast::<String>().unwrap().ptr_eq(&overlay));
        assert_eq!(overlay.phase(), OverlayPhase::Open);
        assert!(registry.is_any_open());
    }

    #[tokio::test]
    async fn test_external_close_then_settle() {
        let registry = registry();
        let slot = registry.allocate_slot();
        let overlay = registry.open::<u32>(slot, "dialog");

        registry.close(slot);

        let snapshot = registry.snapshot();
        assert!(!snapshot.get(slot).unwrap().is_open());
        assert!(!overlay.is_closed());
        assert_eq!(snapshot.pending_closes().count(), 1);
        assert_eq!(snapshot.mounted().count(), 0);
        assert!(!registry.is_any_open());

        registry.settle_pending().await.unwrap();

        assert!(overlay.is_closed());
        assert_eq!(overlay.after_closed().await, None);
        let record = registry.record(slot).unwrap();
        assert!(record.overlay().is_closed());
        assert_eq!(registry.snapshot().pending_closes().count(), 0);
    }

    #[tokio::test]
    async fn test_payload_close_marks_record_closed() {
        let registry = registry();
        let slot = registry.allocate_slot();
        let overlay = registry.open::<&'static str>(slot, "form");

        overlay.close(Some("saved")).await.unwrap();

        let record = registry.record(slot).unwrap();
        assert!(!record.is_open());
        assert!(!record.is_pending_close());
        assert_eq!(overlay.after_closed().await, Some("saved"));
    }

    #[tokio::test]
    async fn test_close_is_noop_for_unknown_or_closed_slot() {
        let registry = registry();
        let slot = registry.allocate_slot();
        let before = registry.snapshot().version();

        registry.close(slot);
        assert_eq!(registry.snapshot().version(), before);

        registry.open::<()>(slot, "popover");
        registry.close(slot);
        let after_first_close = registry.snapshot().version();
        registry.close(slot);
        assert_eq!(registry.snapshot().version(), after_first_close);
    }

    #[tokio::test]
    async fn test_replacing_open_overlay_abandons_previous() {
        let registry = registry();
        let slot = registry.allocate_slot();

        let first = registry.open::<u32>(slot, "first");
        let second = registry.open::<u32>(slot, "second");

        assert!(!first.ptr_eq(&second));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(**snapshot.get(slot).unwrap().payload(), "second");
        assert!(first.is_closed());
        assert_eq!(first.after_closed().await, None);
        assert_eq!(second.phase(), OverlayPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_close_of_replaced_overlay_keeps_replacement_open() {
        let registry = registry();
        let slot = registry.allocate_slot();

        let first = registry.open::<u32>(slot, "first");
        let _slow = first.on_before_close(|_| async {
            sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        let closing = tokio::spawn(first.close(Some(1)));
        tokio::task::yield_now().await;

        let second = registry.open::<u32>(slot, "second");
        closing.await.unwrap().unwrap();

        assert_eq!(first.after_closed().await, Some(1));
        assert!(registry.record(slot).unwrap().is_open());
        assert_eq!(second.phase(), OverlayPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_close_still_closes_record() {
        let registry = registry();
        let slot = registry.allocate_slot();
        let overlay = registry.open::<u32>(slot, "sheet");
        let _slow = overlay.on_before_close(|_| async {
            sleep(Duration::from_millis(50)).await;
            Ok(())
        });

        let waited = tokio::time::timeout(Duration::from_millis(10), overlay.close(Some(1))).await;
        assert!(waited.is_err());
        assert!(registry.record(slot).unwrap().is_open());

        assert_eq!(overlay.after_closed().await, Some(1));
        assert!(overlay.is_closed());
        assert!(!registry.record(slot).unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_close_finishes_despite_external_close() {
        let registry = registry();
        let slot = registry.allocate_slot();
        let overlay = registry.open::<u32>(slot, "sheet");
        let _slow = overlay.on_before_close(|_| async {
            sleep(Duration::from_millis(20)).await;
            Ok(())
        });

        drop(overlay.close(Some(7)));
        registry.close(slot);
        registry.settle_pending().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), overlay.after_closed()).await;
        assert_eq!(result.unwrap(), Some(7));
        assert!(!registry.record(slot).unwrap().is_open());
        assert!(registry.snapshot().pending_closes().next().is_none());
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let registry = registry();
        let a = registry.allocate_slot();
        let b = registry.allocate_slot();
        let first = registry.open::<()>(a, "a");
        let second = registry.open::<()>(b, "b");

        registry.close(a);
        registry.settle_pending().await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(registry.record(b).unwrap().is_open());
        assert!(registry.is_any_open());
    }

    #[tokio::test]
    async fn test_snapshots_are_copy_on_write() {
        let registry = registry();
        let slot = registry.allocate_slot();
        registry.open::<()>(slot, "dialog");

        let before = registry.snapshot();
        registry.close(slot);
        let after = registry.snapshot();

        assert!(before.get(slot).unwrap().is_open());
        assert!(!after.get(slot).unwrap().is_open());
        assert!(after.version() > before.version());
    }

    #[tokio::test]
    async fn test_subscribers_see_every_change() {
        let registry = registry();
        let mut updates = registry.subscribe();
        let slot = registry.allocate_slot();

        registry.open::<()>(slot, "dialog");
        updates.changed().await.unwrap();
        assert!(updates.borrow_and_update().is_any_open());

        registry.close(slot);
        updates.changed().await.unwrap();
        assert!(!updates.borrow_and_update().is_any_open());
    }

    #[tokio::test]
    async fn test_prune_and_remove() {
        let registry = registry();
        let closed_slot = registry.allocate_slot();
        let open_slot = registry.allocate_slot();
        registry.open::<()>(closed_slot, "done");
        let open = registry.open::<()>(open_slot, "live");

        registry.close(closed_slot);
        assert_eq!(registry.prune_closed(), 0);
        registry.settle_pending().await.unwrap();
        assert_eq!(registry.prune_closed(), 1);
        assert!(registry.record(closed_slot).is_none());

        assert!(registry.remove(open_slot));
        assert!(!registry.remove(open_slot));
        assert!(open.is_closed());
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_settle_pending_merges_hook_failures() {
        let registry = registry();
        let a = registry.allocate_slot();
        let b = registry.allocate_slot();
        let first = registry.open::<()>(a, "a");
        let second = registry.open::<()>(b, "b");
        let _ = first.on_before_close(|_| async { Err(anyhow::anyhow!("first failed")) });
        let _ = second.on_before_close(|_| async { Err(anyhow::anyhow!("second failed")) });

        registry.close(a);
        registry.close(b);
        let error = registry.settle_pending().await.unwrap_err();

        match error {
            OverlayError::BeforeClose(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(first.is_closed());
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let registry = registry();
        let (sender, mut events) = mpsc::unbounded_channel();
        registry.set_event_sender(sender);
        let slot = registry.allocate_slot();

        registry.open::<()>(slot, "one");
        registry.open::<()>(slot, "two");
        registry.close(slot);
        registry.settle_pending().await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                OverlayEvent::Opened { slot, generation: 1 },
                OverlayEvent::Replaced { slot, generation: 1 },
                OverlayEvent::Opened { slot, generation: 2 },
                OverlayEvent::CloseRequested { slot, generation: 2 },
                OverlayEvent::Closed { slot, generation: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_ids_unique_across_overlays() {
        let registry = registry();
        let first = registry.open::<()>(registry.allocate_slot(), "a");
        let second = registry.open::<()>(registry.allocate_slot(), "b");

        let a = first.on_before_close_sync(|_| {});
        let b = second.on_before_close_sync(|_| {});

        assert_ne!(a.id(), b.id());
    }
}
