//! Per-call-site overlay controller

use super::ids::SlotId;
use super::overlay_ref::OverlayRef;
use super::registry::OverlayRegistry;
use std::marker::PhantomData;

/// Opens and closes overlays in one slot of a registry
///
/// A controller is reused across many open/close cycles but governs at most
/// one open overlay at a time: opening again replaces the current one. Use
/// one controller per overlay that must be able to stay open concurrently.
pub struct OverlayController<P, R> {
    registry: OverlayRegistry<P>,
    slot: SlotId,
    _result: PhantomData<fn() -> R>,
}

impl<P, R> OverlayController<P, R>
where
    P: Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Bind a new controller to a freshly allocated slot
    pub fn new(registry: OverlayRegistry<P>) -> Self {
        let slot = registry.allocate_slot();
        Self {
            registry,
            slot,
            _result: PhantomData,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Show `payload`, replacing the overlay currently in this slot
    pub fn open(&self, payload: P) -> OverlayRef<R> {
        self.registry.open(self.slot, payload)
    }

    /// Dismiss the overlay in this slot from the outside
    ///
    /// Its completion resolves with `None`.
    pub fn close(&self) {
        self.registry.close(self.slot)
    }

    /// Whether an overlay in this slot is currently open
    pub fn is_open(&self) -> bool {
        self.registry
            .record(self.slot)
            .is_some_and(|record| record.is_open())
    }

    /// The overlay currently occupying this slot, open or not
    pub fn current(&self) -> Option<OverlayRef<R>> {
        self.registry
            .record(self.slot)
            .and_then(|record| record.overlay().downcast())
    }
}

impl<P, R> Clone for OverlayController<P, R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            slot: self.slot,
            _result: PhantomData,
        }
    }
}

impl<P, R> std::fmt::Debug for OverlayController<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayController")
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controllers_get_distinct_slots() {
        let registry = OverlayRegistry::<String>::new();
        let first = registry.controller::<()>();
        let second = registry.controller::<()>();

        assert_ne!(first.slot(), second.slot());
    }

    #[tokio::test]
    async fn test_open_and_await_payload_result() {
        let registry = OverlayRegistry::<String>::new();
        let controller = registry.controller::<String>();

        let overlay = controller.open("Greeting".to_string());
        assert!(controller.is_open());

        let payload_side = controller.current().unwrap();
        payload_side.close(Some("Hello, World".to_string())).await.unwrap();

        assert_eq!(overlay.after_closed().await, Some("Hello, World".to_string()));
        assert!(!controller.is_open());
    }

    #[tokio::test]
    async fn test_external_close_resolves_none() {
        let registry = OverlayRegistry::<String>::new();
        let controller = registry.controller::<String>();
        let overlay = controller.open("Confirm".to_string());

        controller.close();
        assert!(!controller.is_open());
        registry.settle_pending().await.unwrap();

        assert!(overlay.is_closed());
        assert_eq!(overlay.after_closed().await, None);
    }

    #[tokio::test]
    async fn test_second_open_replaces_first() {
        let registry = OverlayRegistry::<String>::new();
        let controller = registry.controller::<u8>();

        let first = controller.open("one".to_string());
        let second = controller.open("two".to_string());

        assert!(!first.ptr_eq(&second));
        assert!(controller.current().unwrap().ptr_eq(&second));
        assert_eq!(registry.snapshot().mounted().count(), 1);
    }

    #[tokio::test]
    async fn test_closing_one_controller_leaves_other_open() {
        let registry = OverlayRegistry::<String>::new();
        let drawer = registry.controller::<()>();
        let modal = registry.controller::<()>();
        let drawer_ref = drawer.open("drawer".to_string());
        let modal_ref = modal.open("modal".to_string());

        drawer.close();
        registry.settle_pending().await.unwrap();

        assert!(drawer_ref.is_closed());
        assert!(!drawer.is_open());
        assert!(!modal_ref.is_closed());
        assert!(modal.is_open());
    }

    #[tokio::test]
    async fn test_controller_reused_across_cycles() {
        let registry = OverlayRegistry::<String>::new();
        let controller = registry.controller::<u32>();

        for round in 0..3 {
            let overlay = controller.open(format!("round {round}"));
            overlay.close(Some(round)).await.unwrap();
            assert_eq!(overlay.after_closed().await, Some(round));
        }

        assert_eq!(registry.snapshot().len(), 1);
    }
}
