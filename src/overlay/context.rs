//! Explicit overlay context handed to payload code
//!
//! A rendering layer builds one [`OverlayContext`] per mounted overlay and
//! passes it to the payload, either directly or by running the payload's
//! futures inside [`OverlayContext::scope`]. Nested code then looks the
//! overlay up with a typed accessor.

use super::overlay_ref::OverlayRef;
use super::registry::AnyOverlayRef;
use super::types::{OverlayError, OverlayResult};
use std::future::Future;

tokio::task_local! {
    static CURRENT_OVERLAY: OverlayContext;
}

/// The overlay (if any) that surrounds a piece of payload code
#[derive(Debug, Clone, Default)]
pub struct OverlayContext {
    overlay: Option<AnyOverlayRef>,
}

impl OverlayContext {
    /// Context outside of any overlay
    pub fn root() -> Self {
        Self::default()
    }

    /// Context inside `overlay`
    pub fn for_overlay(overlay: impl Into<AnyOverlayRef>) -> Self {
        Self {
            overlay: Some(overlay.into()),
        }
    }

    pub fn is_inside_overlay(&self) -> bool {
        self.overlay.is_some()
    }

    pub fn overlay(&self) -> Option<&AnyOverlayRef> {
        self.overlay.as_ref()
    }

    /// The surrounding overlay; a usage error when there is none
    pub fn overlay_ref<R>(&self) -> OverlayResult<OverlayRef<R>>
    where
        R: Clone + Send + Sync + 'static,
    {
        self.try_overlay_ref()?.ok_or(OverlayError::MissingContext)
    }

    /// The surrounding overlay, or `None` for code that may run outside one
    pub fn try_overlay_ref<R>(&self) -> OverlayResult<Option<OverlayRef<R>>>
    where
        R: Clone + Send + Sync + 'static,
    {
        match &self.overlay {
            None => Ok(None),
            Some(overlay) => overlay.downcast().map(Some).ok_or_else(|| {
                OverlayError::ResultTypeMismatch {
                    expected: std::any::type_name::<R>(),
                }
            }),
        }
    }

    /// Run `future` with this context installed for the current task
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        CURRENT_OVERLAY.scope(self, future)
    }

    /// Run `f` with this context installed
    pub fn in_scope<T>(self, f: impl FnOnce() -> T) -> T {
        CURRENT_OVERLAY.sync_scope(self, f)
    }

    /// The innermost installed context, or the root context outside any scope
    pub fn current() -> Self {
        CURRENT_OVERLAY.try_with(Clone::clone).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayRegistry;

    #[test]
    fn test_required_lookup_fails_outside_overlay() {
        let error = OverlayContext::root().overlay_ref::<String>().unwrap_err();

        assert!(matches!(error, OverlayError::MissingContext));
        assert!(error.to_string().contains("inside an open overlay"));
    }

    #[test]
    fn test_optional_lookup_returns_none_outside_overlay() {
        let found = OverlayContext::root().try_overlay_ref::<String>().unwrap();

        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_lookup_checks_result_type() {
        let registry = OverlayRegistry::<()>::new();
        let overlay = registry.open::<u32>(registry.allocate_slot(), ());
        let context = OverlayContext::for_overlay(overlay.clone());

        assert!(context.overlay_ref::<u32>().unwrap().ptr_eq(&overlay));
        assert!(matches!(
            context.overlay_ref::<String>(),
            Err(OverlayError::ResultTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_scope_exposes_context_to_nested_code() {
        let registry = OverlayRegistry::<()>::new();
        let overlay = registry.open::<&'static str>(registry.allocate_slot(), ());

        assert!(!OverlayContext::current().is_inside_overlay());

        OverlayContext::for_overlay(overlay.clone())
            .scope(async {
                let nested = OverlayContext::current()
                    .overlay_ref::<&'static str>()
                    .unwrap();
                nested.close(Some("from inside")).await.unwrap();
            })
            .await;

        assert_eq!(overlay.after_closed().await, Some("from inside"));
        assert!(!OverlayContext::current().is_inside_overlay());
    }

    #[tokio::test]
    async fn test_inner_scope_shadows_outer() {
        let registry = OverlayRegistry::<()>::new();
        let outer = registry.open::<()>(registry.allocate_slot(), ());
        let inner = registry.open::<()>(registry.allocate_slot(), ());

        OverlayContext::for_overlay(outer.clone()).in_scope(|| {
            OverlayContext::for_overlay(inner.clone()).in_scope(|| {
                let current = OverlayContext::current().overlay_ref::<()>().unwrap();
                assert!(current.ptr_eq(&inner));
            });
            let current = OverlayContext::current().overlay_ref::<()>().unwrap();
            assert!(current.ptr_eq(&outer));
        });
    }
}
