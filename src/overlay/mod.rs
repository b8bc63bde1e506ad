//! Overlay lifecycle coordination
//!
//! Transient surfaces (dialogs, drawers, popovers) are opened through an
//! [`OverlayController`], tracked by an [`OverlayRegistry`] and closed through
//! their [`OverlayRef`]. Closing runs every registered before-close hook to
//! completion before the overlay is considered gone and its result is handed
//! to whoever awaits it.

pub mod context;
pub mod controller;
pub mod ids;
pub mod overlay_ref;
pub mod registry;
pub mod types;

pub use context::OverlayContext;
pub use controller::OverlayController;
pub use ids::{HandleAllocator, HookId, HookIdAllocator, SlotId};
pub use overlay_ref::{HookDisposer, OverlayRef, WeakOverlayRef};
pub use registry::{AnyOverlayRef, OverlayRecord, OverlayRegistry, Snapshot};
pub use types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
