//! Exit transitions that hold an overlay open until its animation ends
//!
//! A dialog or drawer attaches an [`ExitTransition`] to its overlay. When the
//! overlay starts closing, the transition flips to [`TransitionState::Exiting`]
//! and the close waits until the surface reports the animation finished.

use crate::overlay::{lock, HookDisposer, OverlayContext, OverlayRef, OverlayResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Visual state of an overlay's exit transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    /// Fully shown
    Entered,
    /// Closing, animation in progress
    Exiting,
    /// Animation done, the overlay may go away
    Finished,
}

/// Before-close hook waiting on the surface's exit animation
pub struct ExitTransition {
    shared: Arc<TransitionShared>,
    disposer: Option<HookDisposer>,
}

struct TransitionShared {
    state: watch::Sender<TransitionState>,

    /// Wakes the waiting hook
    release: Mutex<Option<oneshot::Sender<()>>>,
}

impl TransitionShared {
    fn finish(&self) {
        let waiter = {
            let mut release = lock(&self.release);
            self.state.send_replace(TransitionState::Finished);
            release.take()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }
}

impl ExitTransition {
    /// Hold `overlay`'s close until [`finish`](Self::finish) is called
    pub fn attach<R>(overlay: &OverlayRef<R>) -> Self
    where
        R: Clone + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(TransitionState::Entered);
        let shared = Arc::new(TransitionShared {
            state,
            release: Mutex::new(None),
        });

        let hook_shared = Arc::clone(&shared);
        let disposer = overlay.on_before_close(move |_| {
            let shared = Arc::clone(&hook_shared);
            async move {
                let (sender, receiver) = oneshot::channel();
                {
                    let mut release = lock(&shared.release);
                    if *shared.state.borrow() == TransitionState::Finished {
                        return Ok(());
                    }
                    *release = Some(sender);
                    shared.state.send_replace(TransitionState::Exiting);
                }

                debug!("Waiting for exit transition");
                // A dropped transition counts as finished
                let _ = receiver.await;
                Ok(())
            }
        });

        Self {
            shared,
            disposer: Some(disposer),
        }
    }

    /// Attach to the overlay of `context`
    ///
    /// With `out_of_overlay` set, a missing overlay yields `Ok(None)` so the
    /// same surface can be used standalone; otherwise it is a usage error.
    pub fn from_context<R>(context: &OverlayContext, out_of_overlay: bool) -> OverlayResult<Option<Self>>
    where
        R: Clone + Send + Sync + 'static,
    {
        let overlay = if out_of_overlay {
            context.try_overlay_ref::<R>()?
        } else {
            Some(context.overlay_ref::<R>()?)
        };
        Ok(overlay.map(|overlay| Self::attach(&overlay)))
    }

    pub fn state(&self) -> TransitionState {
        *self.shared.state.borrow()
    }

    /// Follow state changes, e.g. to start the animation on `Exiting`
    pub fn watch(&self) -> watch::Receiver<TransitionState> {
        self.shared.state.subscribe()
    }

    /// Report the exit animation as done and let the close proceed
    pub fn finish(&self) {
        self.shared.finish();
    }

    /// Stop holding the overlay's close, e.g. when the surface goes away
    pub fn detach(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer.dispose();
        }
        self.shared.finish();
    }
}

impl Drop for ExitTransition {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer.dispose();
        }
        // A dropped sender wakes a waiting hook
        lock(&self.shared.release).take();
    }
}

impl std::fmt::Debug for ExitTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitTransition")
            .field("state", &self.state())
            .finish()
    }
}
