//! A dispatcher whose pending work can be drained on demand.
//!
//! Hosts that call into the tree synchronously (a UI frame callback, a test)
//! cannot wait for an executor to get around to running continuations.
//! [`WorkStealingDispatcher`] hands every runnable to an underlying
//! [`Dispatch`] as usual, but also keeps it in its own FIFO, so
//! [`WorkStealingDispatcher::advance_until_idle`] can run whatever is
//! pending right now on the calling thread. Each runnable runs exactly once,
//! whichever side gets to it first.
//!
//!
//! A tree's background tasks are started through a [`Dispatch`], so a host
//! without a tokio runtime can own their progress:
//!
//! ```ignore
//! let dispatcher = WorkStealingDispatcher::new(ManualDispatch::new());
//! let mut root = Node::root_with_dispatch(
//!     workflow,
//!     props,
//!     None,
//!     RuntimeConfig::default(),
//!     Arc::new(NoopInterceptor),
//!     Arc::new(dispatcher.clone()),
//! );
//! let rendering = root.render(props);
//!
//! // Inside a synchronous frame callback:
//! dispatcher.advance_until_idle();
//! while let Some(applied) = root.try_next_action() { /* ... */ }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::task::Context;

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use tracing::trace;

/// A unit of work handed to a dispatcher.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// Something that eventually runs runnables.
pub trait Dispatch: Send + Sync {
    /// Schedule `runnable` to run later.
    fn dispatch(&self, runnable: Runnable);
}

impl Dispatch for tokio::runtime::Handle {
    fn dispatch(&self, runnable: Runnable) {
        drop(self.spawn(async move { runnable() }));
    }
}

/// A dispatcher that only runs work when the host pumps it.
#[derive(Default)]
pub struct ManualDispatch {
    queue: Mutex<VecDeque<Runnable>>,
}

impl ManualDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued runnables, including ones queued while running, until the
    /// queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(runnable) = lock(&self.queue).pop_front() {
            runnable();
            ran += 1;
        }
        ran
    }

    /// Number of queued runnables.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatch for ManualDispatch {
    fn dispatch(&self, runnable: Runnable) {
        lock(&self.queue).push_back(runnable);
    }
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn dispatch(&self, runnable: Runnable) {
        (**self).dispatch(runnable)
    }
}

/// Run `future` to completion by polling it through `dispatch`.
///
/// Every wake dispatches another poll, so the future makes progress whenever
/// the dispatcher runs its work. Nothing here needs a tokio runtime.
pub fn spawn_on<F>(dispatch: Arc<dyn Dispatch>, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = Arc::new(SpawnedTask {
        future: Mutex::new(Some(Box::pin(future))),
        notified: AtomicBool::new(false),
        dispatch,
    });
    task.schedule();
}

/// A runnable that can be claimed by either the delegate or a drain.
struct Stealable {
    runnable: Mutex<Option<Runnable>>,
}

impl Stealable {
    fn run(&self) {
        let runnable = lock(&self.runnable).take();
        if let Some(runnable) = runnable {
            runnable();
        }
    }

    fn is_done(&self) -> bool {
        lock(&self.runnable).is_none()
    }
}

/// Wraps a [`Dispatch`] so its pending work can be stolen and run inline.
#[derive(Clone)]
pub struct WorkStealingDispatcher {
    delegate: Arc<dyn Dispatch>,
    pending: Arc<Mutex<VecDeque<Arc<Stealable>>>>,
}

impl WorkStealingDispatcher {
    pub fn new(delegate: impl Dispatch + 'static) -> Self {
        Self {
            delegate: Arc::new(delegate),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue `runnable` and hand it to the delegate.
    pub fn dispatch(&self, runnable: Runnable) {
        let stealable = Arc::new(Stealable {
            runnable: Mutex::new(Some(runnable)),
        });
        {
            let mut pending = lock(&self.pending);
            while pending.front().is_some_and(|front| front.is_done()) {
                pending.pop_front();
            }
            pending.push_back(stealable.clone());
        }
        self.delegate.dispatch(Box::new(move || stealable.run()));
    }

    /// Run `future` to completion, polling it through this dispatcher.
    ///
    /// The future makes progress both when the delegate runs and when the
    /// host calls [`WorkStealingDispatcher::advance_until_idle`].
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        spawn_on(Arc::new(self.clone()), future);
    }

    /// Run pending runnables on this thread, oldest first, until none are
    /// left. Work queued by those runnables is drained too.
    ///
    /// Safe to call reentrantly and from several threads; concurrent drains
    /// only guarantee that everything runs, not in which order.
    pub fn advance_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = lock(&self.pending).pop_front();
            let Some(stealable) = next else {
                break;
            };
            if !stealable.is_done() {
                stealable.run();
                ran += 1;
            }
        }
        if ran > 0 {
            trace!(ran, "drained pending work");
        }
        ran
    }

    /// Whether nothing is waiting to run.
    pub fn is_idle(&self) -> bool {
        lock(&self.pending).iter().all(|stealable| stealable.is_done())
    }
}

impl Dispatch for WorkStealingDispatcher {
    fn dispatch(&self, runnable: Runnable) {
        WorkStealingDispatcher::dispatch(self, runnable)
    }
}

struct SpawnedTask {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Set by every wake; cleared by the poller before each poll.
    notified: AtomicBool,
    dispatch: Arc<dyn Dispatch>,
}

impl SpawnedTask {
    fn schedule(self: &Arc<Self>) {
        let task = self.clone();
        self.dispatch.dispatch(Box::new(move || task.poll()));
    }

    fn poll(self: &Arc<Self>) {
        self.notified.store(true, Ordering::SeqCst);
        loop {
            {
                // Whoever holds the lock sees `notified` and polls again.
                let mut slot = match self.future.try_lock() {
                    Ok(slot) => slot,
                    Err(TryLockError::WouldBlock) => return,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                };
                while self.notified.swap(false, Ordering::SeqCst) {
                    let Some(future) = slot.as_mut() else {
                        return;
                    };
                    let waker = waker_ref(self);
                    let mut cx = Context::from_waker(&waker);
                    if future.as_mut().poll(&mut cx).is_ready() {
                        *slot = None;
                        return;
                    }
                }
            }
            if !self.notified.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl ArcWake for SpawnedTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
