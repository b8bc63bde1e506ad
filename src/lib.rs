//! Lifecycle coordination for transient overlays
//!
//! Dialogs, drawers and popovers are opened programmatically, may hand back a
//! result, and must wait for their before-close hooks (exit animations,
//! cleanup) before they are torn down.
//!
//! ```no_run
//! use overlay_kit::overlay::OverlayRegistry;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let registry = OverlayRegistry::<String>::new();
//! let confirm = registry.controller::<bool>();
//!
//! let overlay = confirm.open("Delete file?".to_string());
//! // ... the payload later calls `overlay.close(Some(true))`
//! let answer = overlay.after_closed().await;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod host;
pub mod overlay;

pub use config::Config;
pub use host::{ExitTransition, OverlayHost, Surface, TransitionState};
pub use overlay::{
    AnyOverlayRef, HookDisposer, OverlayContext, OverlayController, OverlayError, OverlayEvent,
    OverlayPhase, OverlayRef, OverlayRegistry, OverlayResult, SlotId, WeakOverlayRef,
};
