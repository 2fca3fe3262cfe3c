//! The render context: everything a render function may do to the tree.
//!
//! A [`RenderContext`] is only reachable from inside `Workflow::render`, so
//! declaring children, tasks and remembered values after the pass has
//! returned is impossible by construction. The one capability that escapes
//! the pass is the [`ActionSink`], and it follows the opposite rule: it is
//! frozen while the pass runs and may only be written once render returns.
//!
//! ```text
//!              render_child / running_task / remember    ActionSink::send
//! pass live    allowed                                   contract violation
//! pass frozen  unreachable                               allowed
//! ```

use std::any::{type_name, Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::{Action, Updater};
use crate::error::{contract_violation, CanopyError};
use crate::identity::{WorkflowIdentifier, WorkflowSession};
use crate::interceptor::{unerase, Erased, RenderContextInterceptor};
use crate::staging::ActiveStagingList;
use crate::subtree::SubtreeManager;
use crate::task::{TaskRecord, TaskScope};
use crate::workflow::Workflow;

/// Capabilities handed to `Workflow::render` for one pass.
pub struct RenderContext<'a, W: Workflow> {
    pub(crate) session: &'a Arc<WorkflowSession>,
    pub(crate) subtree: &'a mut SubtreeManager<W>,
    pub(crate) tasks: &'a mut ActiveStagingList<TaskRecord>,
    pub(crate) remembered: &'a mut ActiveStagingList<RememberedValue>,
    pub(crate) sink: ActionSink<W>,
    pub(crate) trigger: &'a RenderTrigger,
    pub(crate) token: &'a CancellationToken,
    pub(crate) intercept: Option<Arc<dyn RenderContextInterceptor>>,
}

impl<'a, W: Workflow> RenderContext<'a, W> {
    /// Render `child` under `key`, creating its node on first use.
    ///
    /// `handler` turns the child's outputs into actions for this node.
    ///
    /// # Panics
    ///
    /// If a child of the same workflow type was already rendered under `key`
    /// during this pass.
    pub fn render_child<C, H>(&mut self, child: C, props: C::Props, key: &str, handler: H) -> C::Rendering
    where
        C: Workflow,
        H: Fn(C::Output) -> Action<W> + Send + Sync + 'static,
    {
        let Some(intercept) = self.intercept.clone() else {
            return self.subtree.render_child(child, props, key, Box::new(handler));
        };

        let session = self.session.clone();
        let identifier = WorkflowIdentifier::of::<C>();
        let rendering = intercept.on_render_child(
            &session,
            &identifier,
            key,
            Box::new(props),
            Box::new(|props: Erased| {
                let props = unerase::<C::Props>(props, "on_render_child", &session);
                Box::new(self.subtree.render_child(child, props, key, Box::new(handler))) as Erased
            }),
        );
        unerase::<C::Rendering>(rendering, "on_render_child", &session)
    }

    /// Render a child whose outputs this node ignores.
    pub fn render_child_ignoring_output<C: Workflow>(
        &mut self,
        child: C,
        props: C::Props,
        key: &str,
    ) -> C::Rendering {
        self.render_child(child, props, key, |_| Action::noop())
    }

    /// Keep a background task running for as long as passes declare `key`.
    ///
    /// The body is started on the current tokio runtime once this pass has
    /// committed, and is handed a [`TaskScope`] for sending actions and
    /// observing cancellation. Later passes that declare the same key keep
    /// the running task and ignore their `body`.
    ///
    /// # Panics
    ///
    /// If `key` was already declared during this pass.
    pub fn running_task<F, Fut>(&mut self, key: impl Into<String>, body: F)
    where
        F: FnOnce(TaskScope<W>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.tasks.staged().iter().any(|task| task.key() == key) {
            contract_violation(CanopyError::DuplicateTask {
                key,
                session: self.session.to_string(),
            });
        }

        match self.intercept.clone() {
            None => self.declare_task(key, body),
            Some(intercept) => {
                let session = self.session.clone();
                let name = key.clone();
                intercept.on_running_task(&session, &name, Box::new(move || self.declare_task(key, body)));
            }
        }
    }

    fn declare_task<F, Fut>(&mut self, key: String, body: F)
    where
        F: FnOnce(TaskScope<W>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = key.clone();
        let sink = self.sink.clone();
        let token = self.token;
        self.tasks
            .retain_or_create(|task| task.key() == name, || TaskRecord::new(key, sink, token, body));
    }

    /// Memoize `compute(&inputs)` under `key`.
    ///
    /// The cached value is reused across passes for as long as the key, the
    /// result type and the inputs stay equal. A remembered value that no pass
    /// declares is dropped when that pass commits.
    ///
    /// # Panics
    ///
    /// If the same key, result type and inputs were already remembered during
    /// this pass.
    pub fn remember<I, T>(&mut self, key: impl Into<String>, inputs: I, compute: impl FnOnce(&I) -> T) -> T
    where
        I: PartialEq + Send + 'static,
        T: Clone + Send + 'static,
    {
        let key = key.into();
        if self
            .remembered
            .staged()
            .iter()
            .any(|value| value.matches::<I, T>(&key, &inputs))
        {
            contract_violation(CanopyError::DuplicateRemember {
                key,
                result_type: type_name::<T>(),
                session: self.session.to_string(),
            });
        }

        let Some(intercept) = self.intercept.clone() else {
            return self.remember_value(key, inputs, compute);
        };

        let session = self.session.clone();
        let name = key.clone();
        let value = intercept.on_remember(
            &session,
            &name,
            type_name::<T>(),
            Box::new(move || Box::new(self.remember_value(key, inputs, compute)) as Erased),
        );
        unerase::<T>(value, "on_remember", &session)
    }

    fn remember_value<I, T>(&mut self, key: String, inputs: I, compute: impl FnOnce(&I) -> T) -> T
    where
        I: PartialEq + Send + 'static,
        T: Clone + Send + 'static,
    {
        let cached = self
            .remembered
            .retain(|value| value.matches::<I, T>(&key, &inputs))
            .and_then(|value| value.value.downcast_ref::<T>())
            .cloned();
        if let Some(value) = cached {
            return value;
        }

        let value = compute(&inputs);
        self.remembered.stage(RememberedValue {
            key,
            result_type: TypeId::of::<T>(),
            inputs: Box::new(inputs),
            value: Box::new(value.clone()),
        });
        value
    }

    /// A callback that sends the action built by `update` for every event.
    ///
    /// Calling it while this pass is still running is a contract violation.
    pub fn event_handler<E, F>(&self, name: impl Into<Cow<'static, str>>, update: F) -> EventHandler<E>
    where
        E: Send + 'static,
        F: Fn(&mut Updater<'_, W>, E) + Send + Sync + 'static,
    {
        let name = name.into();
        let update = Arc::new(update);
        let sink = self.sink.clone();
        EventHandler {
            send: Arc::new(move |event| {
                let update = update.clone();
                sink.send(Action::new(name.clone(), move |updater| update(updater, event)));
            }),
        }
    }

    /// The sink for this node's action queue.
    pub fn action_sink(&self) -> ActionSink<W> {
        self.sink.clone()
    }

    /// The trigger external state uses to request a new render of this node.
    pub fn render_trigger(&self) -> RenderTrigger {
        self.trigger.clone()
    }

    /// Metadata about the node being rendered.
    pub fn session(&self) -> &Arc<WorkflowSession> {
        self.session
    }
}

/// Write-only handle to a node's action queue.
pub struct ActionSink<W: Workflow> {
    tx: mpsc::UnboundedSender<Action<W>>,
    live: Arc<AtomicBool>,
    session: Arc<WorkflowSession>,
    intercept: Option<Arc<dyn RenderContextInterceptor>>,
}

impl<W: Workflow> Clone for ActionSink<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            live: self.live.clone(),
            session: self.session.clone(),
            intercept: self.intercept.clone(),
        }
    }
}

impl<W: Workflow> ActionSink<W> {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Action<W>>,
        live: Arc<AtomicBool>,
        session: Arc<WorkflowSession>,
        intercept: Option<Arc<dyn RenderContextInterceptor>>,
    ) -> Self {
        Self {
            tx,
            live,
            session,
            intercept,
        }
    }

    /// Queue `action` for the node.
    ///
    /// Actions sent to a node that has since been torn down are dropped.
    ///
    /// # Panics
    ///
    /// If the render pass that created this sink has not returned yet.
    pub fn send(&self, action: Action<W>) {
        if self.live.load(Ordering::Acquire) {
            contract_violation(CanopyError::SendDuringRender {
                action: action.name_cow(),
                session: self.session.to_string(),
            });
        }

        match &self.intercept {
            None => self.enqueue(action),
            Some(intercept) => {
                let name = action.name_cow();
                intercept.on_action_sent(
                    &self.session,
                    &name,
                    Box::new(action),
                    Box::new(|action: Erased| {
                        self.enqueue(unerase::<Action<W>>(action, "on_action_sent", &self.session))
                    }),
                );
            }
        }
    }

    fn enqueue(&self, action: Action<W>) {
        if let Err(mpsc::error::SendError(action)) = self.tx.send(action) {
            debug!(
                session = %self.session,
                action = action.name(),
                "dropping action sent to a finished node"
            );
        }
    }
}

impl<W: Workflow> fmt::Debug for ActionSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSink")
            .field("session", &self.session.to_string())
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

/// A cloneable callback produced by [`RenderContext::event_handler`].
pub struct EventHandler<E> {
    send: Arc<dyn Fn(E) + Send + Sync>,
}

impl<E> Clone for EventHandler<E> {
    fn clone(&self) -> Self {
        Self {
            send: self.send.clone(),
        }
    }
}

impl<E> EventHandler<E> {
    /// Deliver `event` to the node.
    pub fn call(&self, event: E) {
        (self.send)(event)
    }
}

impl<E> fmt::Debug for EventHandler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventHandler")
    }
}

/// Requests a render of one node without going through its action queue.
///
/// For state kept outside the node: whoever mutates it calls
/// [`RenderTrigger::request_render`], and the node's next selection reports a
/// state change.
#[derive(Clone, Default)]
pub struct RenderTrigger {
    inner: Arc<TriggerInner>,
}

#[derive(Default)]
struct TriggerInner {
    requested: AtomicBool,
    waker: AtomicWaker,
}

impl RenderTrigger {
    /// Mark the node dirty and wake whoever is selecting on it.
    pub fn request_render(&self) {
        self.inner.requested.store(true, Ordering::Release);
        self.inner.waker.wake();
    }

    /// Whether a render was requested and not yet observed.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub(crate) fn poll_requested(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.requested.swap(false, Ordering::AcqRel) {
            return Poll::Ready(());
        }
        self.inner.waker.register(cx.waker());
        if self.inner.requested.swap(false, Ordering::AcqRel) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for RenderTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTrigger")
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// A memoized value and the inputs it was computed from.
pub(crate) struct RememberedValue {
    key: String,
    result_type: TypeId,
    inputs: Box<dyn Any + Send>,
    value: Box<dyn Any + Send>,
}

impl RememberedValue {
    fn matches<I: PartialEq + 'static, T: 'static>(&self, key: &str, inputs: &I) -> bool {
        self.key == key
            && self.result_type == TypeId::of::<T>()
            && self.inputs.downcast_ref::<I>() == Some(inputs)
    }
}
