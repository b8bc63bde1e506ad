//! Per-overlay handle: close control, before-close barrier and completion
//!
//! An [`OverlayRef`] is shared between the registry that triggers its close,
//! the call site that awaits its result and the payload that may close
//! itself. Cloning is cheap; all clones observe the same overlay.

use super::ids::{HookId, HookIdAllocator};
use super::lock;
use super::types::{HookFailures, OverlayPhase, OverlayResult};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

type Hook<R> = Arc<dyn Fn(Option<R>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type CloseUnderlying = Box<dyn FnOnce() + Send>;
type Barrier = Shared<BoxFuture<'static, ()>>;

/// Handle to one opened overlay instance
pub struct OverlayRef<R> {
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    state: Mutex<State>,

    /// Registered before-close hooks, keyed by registration order
    hooks: Mutex<BTreeMap<HookId, Hook<R>>>,

    hook_ids: HookIdAllocator,

    /// Tells the owner that this overlay is gone; taken at most once
    close_underlying: Mutex<Option<CloseUnderlying>>,

    /// `None` while pending, `Some(result)` once closed
    completion: watch::Sender<Option<Option<R>>>,

    /// Hook failures of the last barrier, claimed by the initiating close
    failures: Mutex<Option<HookFailures>>,
}

struct State {
    phase: OverlayPhase,

    /// The running before-close barrier while `Closing`
    barrier: Option<Barrier>,
}

/// Non-owning handle, for hooks that need to look at their own overlay
///
/// A hook that captures a full [`OverlayRef`] keeps the overlay alive for as
/// long as the hook is registered.
pub struct WeakOverlayRef<R> {
    inner: Weak<Inner<R>>,
}

impl<R> WeakOverlayRef<R> {
    /// `None` once every [`OverlayRef`] to the overlay was dropped
    pub fn upgrade(&self) -> Option<OverlayRef<R>> {
        self.inner.upgrade().map(|inner| OverlayRef { inner })
    }
}

impl<R> Clone for WeakOverlayRef<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<R> Clone for OverlayRef<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for OverlayRef<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayRef")
            .field("phase", &lock(&self.inner.state).phase)
            .field("hooks", &lock(&self.inner.hooks).len())
            .finish()
    }
}

impl<R> OverlayRef<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Create a standalone overlay handle that is open right away
    ///
    /// `close_underlying` runs once, after the before-close barrier and
    /// before the completion resolves.
    pub fn new(close_underlying: impl FnOnce() + Send + 'static) -> Self {
        let overlay = Self::unattached(HookIdAllocator::new());
        overlay.attach(close_underlying);
        overlay
    }

    /// Build a handle whose close callback is not wired yet
    pub(crate) fn unattached(hook_ids: HookIdAllocator) -> Self {
        let (completion, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    phase: OverlayPhase::Unattached,
                    barrier: None,
                }),
                hooks: Mutex::new(BTreeMap::new()),
                hook_ids,
                close_underlying: Mutex::new(None),
                completion,
                failures: Mutex::new(None),
            }),
        }
    }

    /// Wire the close callback and open the overlay
    pub(crate) fn attach(&self, close_underlying: impl FnOnce() + Send + 'static) {
        let mut state = lock(&self.inner.state);
        if state.phase != OverlayPhase::Unattached {
            return;
        }

        *lock(&self.inner.close_underlying) = Some(Box::new(close_underlying));
        state.phase = OverlayPhase::Open;
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> OverlayPhase {
        lock(&self.inner.state).phase
    }

    /// Whether the overlay has finished closing
    pub fn is_closed(&self) -> bool {
        self.phase().is_closed()
    }

    /// Whether both handles point at the same overlay instance
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handle that does not keep the overlay alive
    pub fn downgrade(&self) -> WeakOverlayRef<R> {
        WeakOverlayRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register an async callback that must settle before the overlay closes
    ///
    /// The hook receives the close result. Hooks registered once a close has
    /// begun never run for that close; hooks registered after the overlay
    /// closed never run at all and get an inert disposer.
    pub fn on_before_close<F, Fut>(&self, hook: F) -> HookDisposer
    where
        F: Fn(Option<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let state = lock(&self.inner.state);
        if state.phase.is_closed() {
            debug!("Before-close hook registered on a closed overlay, it will never run");
            return HookDisposer::inert();
        }

        let id = self.inner.hook_ids.next();
        let hook: Hook<R> = Arc::new(move |result| hook(result).boxed());
        lock(&self.inner.hooks).insert(id, hook);
        drop(state);

        let weak = Arc::downgrade(&self.inner);
        HookDisposer {
            id: Some(id),
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.hooks).remove(&id);
                }
            })),
        }
    }

    /// Register a synchronous before-close callback
    pub fn on_before_close_sync<F>(&self, hook: F) -> HookDisposer
    where
        F: Fn(Option<R>) + Send + Sync + 'static,
    {
        self.on_before_close(move |result| {
            hook(result);
            future::ready(Ok(()))
        })
    }

    /// Close the overlay, handing `result` to everyone awaiting it
    ///
    /// The phase check, the transition to `Closing` and the snapshot of the
    /// registered hooks happen when this is called, not when the returned
    /// future is first polled. Closing an overlay that is already closed is
    /// a no-op; closing one that is mid-close joins the running barrier and
    /// discards `result`.
    ///
    /// Inside a tokio runtime the barrier runs on its own task, so dropping
    /// the returned future (or timing out on it) never cancels the close.
    /// Outside a runtime the close is driven by whoever awaits it.
    ///
    /// The close completes even if hooks fail; the failures are then
    /// returned as [`OverlayError::BeforeClose`](super::OverlayError).
    pub fn close(&self, result: Option<R>) -> BoxFuture<'static, OverlayResult<()>> {
        let barrier = {
            let mut state = lock(&self.inner.state);
            match state.phase {
                OverlayPhase::Closed => return future::ready(Ok(())).boxed(),
                OverlayPhase::Unattached => {
                    warn!("Overlay is not ready yet, ignoring close request");
                    return future::ready(Ok(())).boxed();
                }
                OverlayPhase::Closing => {
                    debug!("Overlay is already closing, joining the running barrier");
                    let barrier = state.barrier.clone();
                    let completion = self.after_closed();
                    return async move {
                        match barrier {
                            Some(barrier) => barrier.await,
                            None => {
                                completion.await;
                            }
                        }
                        Ok(())
                    }
                    .boxed();
                }
                OverlayPhase::Open => {}
            }

            state.phase = OverlayPhase::Closing;
            let hooks: Vec<(HookId, Hook<R>)> = lock(&self.inner.hooks)
                .iter()
                .map(|(id, hook)| (*id, Arc::clone(hook)))
                .collect();

            let barrier = run_barrier(Arc::downgrade(&self.inner), hooks, result)
                .boxed()
                .shared();
            state.barrier = Some(barrier.clone());
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(barrier.clone());
                }
                Err(_) => debug!("No tokio runtime, the close runs when awaited"),
            }
            barrier
        };

        let inner = Arc::clone(&self.inner);
        async move {
            barrier.await;
            match lock(&inner.failures).take() {
                Some(failures) => Err(failures.into()),
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Close without a result
    pub fn dismiss(&self) -> BoxFuture<'static, OverlayResult<()>> {
        self.close(None)
    }

    /// Resolves with the close result once the overlay has fully closed
    ///
    /// Resolves with `None` when the overlay closed without a result, was
    /// abandoned by a replacement, or was dropped before it ever closed.
    /// Hooks holding an [`OverlayRef`] count as handles; use
    /// [`downgrade`](Self::downgrade) inside hooks instead.
    pub fn after_closed(&self) -> impl Future<Output = Option<R>> + Send + 'static {
        let mut receiver = self.inner.completion.subscribe();
        async move {
            let resolved = receiver
                .wait_for(Option::is_some)
                .await
                .map(|value| (*value).clone());
            resolved.ok().flatten().flatten()
        }
    }

    /// Close a replaced overlay without running hooks or its close callback
    ///
    /// Overlays that already began closing are left to finish on their own.
    pub(crate) fn abandon(&self) {
        {
            let mut state = lock(&self.inner.state);
            match state.phase {
                OverlayPhase::Open | OverlayPhase::Unattached => {
                    state.phase = OverlayPhase::Closed;
                }
                OverlayPhase::Closing | OverlayPhase::Closed => return,
            }
        }

        lock(&self.inner.hooks).clear();
        lock(&self.inner.close_underlying).take();
        self.inner.completion.send_replace(Some(None));
        debug!("Overlay abandoned before closing");
    }
}

/// Invoke every snapshotted hook, wait for all of them, then close
async fn run_barrier<R>(inner: Weak<Inner<R>>, hooks: Vec<(HookId, Hook<R>)>, result: Option<R>)
where
    R: Clone + Send + Sync + 'static,
{
    let pending = hooks.into_iter().map(|(id, hook)| {
        let settled = hook(result.clone());
        async move { (id, settled.await) }
    });

    let failures: Vec<(HookId, anyhow::Error)> = future::join_all(pending)
        .await
        .into_iter()
        .filter_map(|(id, outcome)| outcome.err().map(|error| (id, error)))
        .inspect(|(id, error)| warn!("Before-close {} failed: {:#}", id, error))
        .collect();

    let Some(inner) = inner.upgrade() else {
        return;
    };

    {
        let mut state = lock(&inner.state);
        state.phase = OverlayPhase::Closed;
        state.barrier = None;
    }
    lock(&inner.hooks).clear();

    if !failures.is_empty() {
        *lock(&inner.failures) = Some(HookFailures::new(failures));
    }

    let close_underlying = lock(&inner.close_underlying).take();
    if let Some(close_underlying) = close_underlying {
        close_underlying();
    }

    inner.completion.send_replace(Some(result));
}

/// Removes one before-close registration
///
/// Dropping a disposer keeps its hook registered.
pub struct HookDisposer {
    id: Option<HookId>,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl HookDisposer {
    fn inert() -> Self {
        Self {
            id: None,
            remove: None,
        }
    }

    /// Id of the registration, `None` for a hook that was never stored
    pub fn id(&self) -> Option<HookId> {
        self.id
    }

    /// Deregister the hook
    pub fn dispose(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for HookDisposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDisposer").field("id", &self.id).finish()
    }
}
