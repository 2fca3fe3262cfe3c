//! One running state machine in the tree.
//!
//! A [`Node`] owns its workflow's state, a private action queue, its children
//! (through the subtree manager) and its background tasks. Everything it owns
//! hangs off its cancellation token, so cancelling or dropping a node tears
//! down its whole subtree.
//!
//! # Action Selection
//!
//! Selection polls, in order:
//!
//! 1. every child, in the order they were last rendered (recursively)
//! 2. the node's own action queue
//! 3. the node's render trigger
//!
//! The first ready source wins, so ties always break in that order.
//!
//! # Propagation
//!
//! Applying an action yields an [`ActionApplied`]. A result with an output
//! travels to the parent, whose handler turns the output into one of its own
//! actions. A result without one is absorbed, and ancestors only learn that
//! something below them changed. The state-changed flag is sticky: once set
//! on a path it stays set all the way up.
//!
//! With [`RuntimeOption::PartialTreeRendering`] every result is escorted to
//! the root, marking each ancestor dirty, so clean subtrees can skip their
//! render pass.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::action::{Action, ActionApplied};
use crate::config::{RuntimeConfig, RuntimeOption};
use crate::context::{ActionSink, RememberedValue, RenderContext, RenderTrigger};
use crate::error::CanopyError;
use crate::identity::{NodeId, WorkflowSession};
use crate::interceptor::{unerase, Erased, Interceptor, NoopInterceptor, RenderContextInterceptor};
use crate::snapshot::{Snapshot, TreeSnapshot};
use crate::staging::ActiveStagingList;
use crate::subtree::{ChildResult, SubtreeManager};
use crate::task::TaskRecord;
use crate::work_stealing::Dispatch;
use crate::workflow::Workflow;

/// Settings shared by every node in a tree.
#[derive(Clone)]
pub(crate) struct NodeEnv {
    pub(crate) config: RuntimeConfig,
    pub(crate) interceptor: Arc<dyn Interceptor>,
    /// Runs background tasks; the current tokio runtime when unset.
    pub(crate) dispatch: Option<Arc<dyn Dispatch>>,
}

/// The outcome of one selection step, before the parent sees it.
#[derive(Debug)]
pub(crate) enum NodeResult<O> {
    /// Escort this result to the parent.
    Propagate(ActionApplied<O>),
    /// Absorbed here; the parent only learns whether anything changed.
    Settled { state_changed: bool },
}

impl<O> NodeResult<O> {
    fn into_applied(self) -> ActionApplied<O> {
        match self {
            NodeResult::Propagate(applied) => applied,
            NodeResult::Settled { state_changed } => ActionApplied::silent(state_changed),
        }
    }
}

/// A running instance of workflow `W`.
pub struct Node<W: Workflow> {
    session: Arc<WorkflowSession>,
    workflow: W,
    props: W::Props,
    state: W::State,
    subtree: SubtreeManager<W>,
    tasks: ActiveStagingList<TaskRecord>,
    remembered: ActiveStagingList<RememberedValue>,
    tx: mpsc::UnboundedSender<Action<W>>,
    rx: mpsc::UnboundedReceiver<Action<W>>,
    trigger: RenderTrigger,
    token: CancellationToken,
    env: NodeEnv,
    /// Kept only under partial tree rendering.
    last_rendering: Option<W::Rendering>,
    /// Props, own state or a descendant changed since the last render pass.
    dirty: bool,
}

impl<W: Workflow> Node<W> {
    /// A root node with the baseline configuration and no interceptors.
    pub fn new_root(workflow: W, props: W::Props) -> Self {
        Self::root(workflow, props, None, RuntimeConfig::default(), Arc::new(NoopInterceptor))
    }

    /// A root node, optionally restored from `snapshot`.
    ///
    /// Background tasks run on the tokio runtime that is current when they
    /// start. Use [`chained`](crate::chained) to combine several interceptors.
    pub fn root(
        workflow: W,
        props: W::Props,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptor: Arc<dyn Interceptor>,
    ) -> Self {
        Self::root_in(workflow, props, snapshot, config, interceptor, None)
    }

    /// Like [`Node::root`], but every background task in the tree is polled
    /// through `dispatch`.
    ///
    /// With a [`WorkStealingDispatcher`](crate::WorkStealingDispatcher) over a
    /// [`ManualDispatch`](crate::ManualDispatch), a host without a tokio
    /// runtime drives tasks by calling `advance_until_idle`.
    pub fn root_with_dispatch(
        workflow: W,
        props: W::Props,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptor: Arc<dyn Interceptor>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self::root_in(workflow, props, snapshot, config, interceptor, Some(dispatch))
    }

    pub(crate) fn root_in(
        workflow: W,
        props: W::Props,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptor: Arc<dyn Interceptor>,
        dispatch: Option<Arc<dyn Dispatch>>,
    ) -> Self {
        Self::new(
            NodeId::new::<W>(""),
            workflow,
            props,
            snapshot,
            None,
            CancellationToken::new(),
            NodeEnv {
                config,
                interceptor,
                dispatch,
            },
        )
    }

    pub(crate) fn new(
        id: NodeId,
        workflow: W,
        props: W::Props,
        snapshot: Option<TreeSnapshot>,
        parent: Option<&Arc<WorkflowSession>>,
        token: CancellationToken,
        env: NodeEnv,
    ) -> Self {
        let session = Arc::new(WorkflowSession::new(id, parent.cloned(), env.config.clone()));
        env.interceptor.on_session_started(&session);

        let (restored, snapshot_cache) = match snapshot {
            Some(snapshot) => {
                let (root, children) = snapshot.into_parts();
                (root, Some(children))
            }
            None => (None, None),
        };
        let has_snapshot = restored.is_some();
        let state = initial_state(&workflow, &session, &env, &props, restored);

        let (tx, rx) = mpsc::unbounded_channel();
        let subtree = SubtreeManager::new(session.clone(), token.clone(), env.clone(), snapshot_cache);
        debug!(session = %session, restored = has_snapshot, "workflow node started");

        Self {
            session,
            workflow,
            props,
            state,
            subtree,
            tasks: ActiveStagingList::new(),
            remembered: ActiveStagingList::new(),
            tx,
            rx,
            trigger: RenderTrigger::default(),
            token,
            env,
            last_rendering: None,
            dirty: true,
        }
    }

    /// Metadata about this node.
    pub fn session(&self) -> &Arc<WorkflowSession> {
        &self.session
    }

    /// The current state.
    pub fn state(&self) -> &W::State {
        &self.state
    }

    /// The props of the last render pass.
    pub fn props(&self) -> &W::Props {
        &self.props
    }

    /// The trigger for requesting a render from outside the tree.
    pub fn render_trigger(&self) -> RenderTrigger {
        self.trigger.clone()
    }

    /// Number of live children.
    pub fn child_count(&self) -> usize {
        self.subtree.len()
    }

    /// Whether this node has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn set_workflow(&mut self, workflow: W) {
        self.workflow = workflow;
    }

    /// Render this node and, recursively, its children.
    ///
    /// New props run through `Workflow::on_props_changed` first. Background
    /// tasks declared by the pass are started once it has returned, and
    /// children, tasks and remembered values it did not declare are torn
    /// down.
    pub fn render(&mut self, props: W::Props) -> W::Rendering {
        if props != self.props {
            let old = std::mem::replace(&mut self.props, props);
            let state = self.state.clone();
            self.state = self.props_changed(&old, state);
            self.dirty = true;
        }

        let partial = self.env.config.contains(RuntimeOption::PartialTreeRendering);
        if partial && !self.dirty {
            if let Some(rendering) = &self.last_rendering {
                trace!(session = %self.session, "skipping render of unchanged subtree");
                return rendering.clone();
            }
        }

        let rendering = self.render_pass();
        self.dirty = false;
        if partial {
            self.last_rendering = Some(rendering.clone());
        }
        rendering
    }

    fn props_changed(&self, old: &W::Props, state: W::State) -> W::State {
        let interceptor = &self.env.interceptor;
        if interceptor.is_noop() {
            return self.workflow.on_props_changed(old, &self.props, state);
        }

        let session = &self.session;
        let state = interceptor.on_props_changed(
            session,
            Box::new(old.clone()),
            Box::new(self.props.clone()),
            Box::new(state),
            Box::new(|old: Erased, new: Erased, state: Erased| {
                let old = unerase::<W::Props>(old, "on_props_changed", session);
                let new = unerase::<W::Props>(new, "on_props_changed", session);
                let state = unerase::<W::State>(state, "on_props_changed", session);
                Box::new(self.workflow.on_props_changed(&old, &new, state)) as Erased
            }),
        );
        unerase(state, "on_props_changed", session)
    }

    fn render_pass(&mut self) -> W::Rendering {
        let live = Arc::new(AtomicBool::new(true));
        let Self {
            session,
            workflow,
            props,
            state,
            subtree,
            tasks,
            remembered,
            tx,
            trigger,
            token,
            env,
            ..
        } = self;
        let session: &Arc<WorkflowSession> = session;

        let rendering = if env.interceptor.is_noop() {
            let mut ctx = RenderContext {
                session,
                subtree: &mut *subtree,
                tasks: &mut *tasks,
                remembered: &mut *remembered,
                sink: ActionSink::new(tx.clone(), live.clone(), session.clone(), None),
                trigger: &*trigger,
                token: &*token,
                intercept: None,
            };
            workflow.render(&mut ctx, props, state)
        } else {
            let rendering = env.interceptor.on_render(
                session,
                Box::new(props.clone()),
                Box::new(state.clone()),
                Box::new(
                    |props: Erased, state: Erased, intercept: Option<Arc<dyn RenderContextInterceptor>>| {
                        let props = unerase::<W::Props>(props, "on_render", session);
                        let state = unerase::<W::State>(state, "on_render", session);
                        let mut ctx = RenderContext {
                            session,
                            subtree: &mut *subtree,
                            tasks: &mut *tasks,
                            remembered: &mut *remembered,
                            sink: ActionSink::new(tx.clone(), live.clone(), session.clone(), intercept.clone()),
                            trigger: &*trigger,
                            token: &*token,
                            intercept,
                        };
                        Box::new(workflow.render(&mut ctx, &props, &state)) as Erased
                    },
                ),
            );
            unerase::<W::Rendering>(rendering, "on_render", session)
        };

        // Sinks handed out by this pass may be used from here on.
        live.store(false, Ordering::Release);

        subtree.commit();
        remembered.commit_staging(|_| {});
        tasks.commit_staging(|task| task.cancel(session));
        for task in tasks.active_mut() {
            task.start_if_pending(session, env.dispatch.as_ref());
        }
        rendering
    }

    /// Persist this node and its children.
    pub fn snapshot(&self) -> TreeSnapshot {
        let interceptor = &self.env.interceptor;
        if interceptor.is_noop() {
            return TreeSnapshot::new(
                self.workflow.snapshot_state(&self.state),
                self.subtree.snapshot_children(),
            );
        }

        let session = &self.session;
        interceptor.on_snapshot_state_with_children(
            session,
            Box::new(|| {
                let root = interceptor.on_snapshot_state(
                    session,
                    Box::new(self.state.clone()),
                    Box::new(|state: Erased| {
                        let state = unerase::<W::State>(state, "on_snapshot_state", session);
                        self.workflow.snapshot_state(&state)
                    }),
                );
                TreeSnapshot::new(root, self.subtree.snapshot_children())
            }),
        )
    }

    /// Poll for the next action anywhere in this subtree and apply it.
    ///
    /// Selecting on a cancelled node fails with [`CanopyError::Cancelled`].
    pub fn poll_next_action(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ActionApplied<W::Output>, CanopyError>> {
        self.poll_step(cx).map_ok(NodeResult::into_applied)
    }

    /// Wait for the next action anywhere in this subtree and apply it.
    pub async fn select_next_action(&mut self) -> Result<ActionApplied<W::Output>, CanopyError> {
        poll_fn(|cx| self.poll_next_action(cx)).await
    }

    /// Apply the next action if one is ready right now.
    pub fn try_next_action(&mut self) -> Option<Result<ActionApplied<W::Output>, CanopyError>> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.poll_next_action(&mut cx) {
            Poll::Ready(result) => Some(result),
            Poll::Pending => None,
        }
    }

    /// Whether no action is queued anywhere in this subtree.
    ///
    /// Consumes nothing. Work that has not been queued yet, such as a
    /// running background task, does not count.
    pub fn is_idle(&self) -> bool {
        self.rx.is_empty() && !self.trigger.is_requested() && self.subtree.is_idle()
    }

    pub(crate) fn poll_step(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<NodeResult<W::Output>, CanopyError>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(CanopyError::Cancelled {
                session: self.session.to_string(),
            }));
        }

        if let Poll::Ready(result) = self.subtree.poll_children(cx) {
            return Poll::Ready(match result? {
                ChildResult::Propagated {
                    action: Some(action),
                    state_changed,
                } => self.apply_action(action, state_changed),
                ChildResult::Propagated {
                    action: None,
                    state_changed,
                }
                | ChildResult::Settled { state_changed } => {
                    self.dirty |= state_changed;
                    Ok(self.escort(ActionApplied::silent(state_changed)))
                }
            });
        }

        // The node holds a sender itself, so the queue never closes.
        if let Poll::Ready(Some(action)) = self.rx.poll_recv(cx) {
            return Poll::Ready(self.apply_action(action, false));
        }

        if self.trigger.poll_requested(cx).is_ready() {
            trace!(session = %self.session, "render requested by trigger");
            self.dirty = true;
            return Poll::Ready(Ok(self.escort(ActionApplied::silent(true))));
        }

        Poll::Pending
    }

    fn apply_action(
        &mut self,
        action: Action<W>,
        child_changed: bool,
    ) -> Result<NodeResult<W::Output>, CanopyError> {
        let name = action.name_cow();
        let mut applied = action
            .apply(&self.props, &mut self.state)
            .map_err(|source| CanopyError::ActionFailed {
                action: name.clone(),
                session: self.session.to_string(),
                source,
            })?;
        applied.state_changed |= child_changed;
        self.dirty |= applied.state_changed;

        trace!(
            session = %self.session,
            action = %name,
            state_changed = applied.state_changed,
            has_output = applied.output.is_some(),
            "action applied"
        );
        Ok(self.escort(applied))
    }

    fn escort(&self, applied: ActionApplied<W::Output>) -> NodeResult<W::Output> {
        if applied.output.is_some() || self.env.config.contains(RuntimeOption::PartialTreeRendering) {
            NodeResult::Propagate(applied)
        } else {
            NodeResult::Settled {
                state_changed: applied.state_changed,
            }
        }
    }

    /// Cancel this node, its children and its background tasks.
    ///
    /// Returns once every cancellation signal has been delivered; it does not
    /// wait for task futures to be dropped. Calling it again does nothing.
    pub fn cancel(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.subtree.cancel_all();
        for task in self.tasks.drain_all() {
            task.cancel(&self.session);
        }
        self.token.cancel();
        debug!(session = %self.session, "workflow node cancelled");
    }
}

impl<W: Workflow> Drop for Node<W> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn initial_state<W: Workflow>(
    workflow: &W,
    session: &WorkflowSession,
    env: &NodeEnv,
    props: &W::Props,
    snapshot: Option<Snapshot>,
) -> W::State {
    if env.interceptor.is_noop() {
        return workflow.initial_state(props, snapshot.as_ref());
    }

    let state = env.interceptor.on_initial_state(
        session,
        Box::new(props.clone()),
        snapshot,
        Box::new(|props: Erased, snapshot: Option<Snapshot>| {
            let props = unerase::<W::Props>(props, "on_initial_state", session);
            Box::new(workflow.initial_state(&props, snapshot.as_ref())) as Erased
        }),
    );
    unerase(state, "on_initial_state", session)
}
