//! Cross-cutting hooks around node lifecycle operations.
//!
//! An [`Interceptor`] sees every node in a tree, whatever its workflow type,
//! so values cross the hooks type-erased as [`Erased`]. Hooks that care
//! about a particular workflow downcast; the rest pass values through.
//!
//! Each wrapping hook receives a `proceed` continuation: the rest of the
//! chain plus the underlying operation. A hook may rewrite the inputs before
//! calling `proceed`, rewrite the result after, or skip `proceed` entirely.
//! Handing back a value of the wrong type is a contract violation.
//!
//! # Ordering
//!
//! [`chained`] composes a list so that the first interceptor wraps the
//! second, and so on:
//!
//! ```text
//! I1 before → I2 before → render → I2 after → I1 after
//! ```
//!
//! The render hook can also decorate the render context itself with a
//! [`RenderContextInterceptor`]. Decorators from a chain nest the same way,
//! outermost first.

use std::any::{type_name, Any};
use std::sync::Arc;

use tracing::{debug, debug_span, trace};

use crate::error::{contract_violation, CanopyError};
use crate::identity::{WorkflowIdentifier, WorkflowSession};
use crate::snapshot::{Snapshot, TreeSnapshot};

/// A type-erased value crossing an interceptor hook.
pub type Erased = Box<dyn Any + Send>;

/// Continuation of [`Interceptor::on_initial_state`]: `(props, snapshot) -> state`.
pub type InitialStateProceed<'a> = Box<dyn FnOnce(Erased, Option<Snapshot>) -> Erased + 'a>;

/// Continuation of [`Interceptor::on_props_changed`]: `(old, new, state) -> state`.
pub type PropsChangedProceed<'a> = Box<dyn FnOnce(Erased, Erased, Erased) -> Erased + 'a>;

/// Continuation of [`Interceptor::on_render`]: `(props, state, decorator) -> rendering`.
pub type RenderProceed<'a> =
    Box<dyn FnOnce(Erased, Erased, Option<Arc<dyn RenderContextInterceptor>>) -> Erased + 'a>;

/// Continuation of [`Interceptor::on_snapshot_state`]: `state -> snapshot`.
pub type SnapshotProceed<'a> = Box<dyn FnOnce(Erased) -> Option<Snapshot> + 'a>;

/// Continuation of [`Interceptor::on_snapshot_state_with_children`].
pub type TreeSnapshotProceed<'a> = Box<dyn FnOnce() -> TreeSnapshot + 'a>;

/// Hooks around the lifecycle of every node in a tree.
///
/// Every hook defaults to calling straight through.
pub trait Interceptor: Send + Sync {
    /// A node was created. Called before its initial state is computed.
    fn on_session_started(&self, session: &WorkflowSession) {
        let _ = session;
    }

    /// Wraps `Workflow::initial_state`.
    fn on_initial_state(
        &self,
        session: &WorkflowSession,
        props: Erased,
        snapshot: Option<Snapshot>,
        proceed: InitialStateProceed<'_>,
    ) -> Erased {
        let _ = session;
        proceed(props, snapshot)
    }

    /// Wraps `Workflow::on_props_changed`.
    fn on_props_changed(
        &self,
        session: &WorkflowSession,
        old: Erased,
        new: Erased,
        state: Erased,
        proceed: PropsChangedProceed<'_>,
    ) -> Erased {
        let _ = session;
        proceed(old, new, state)
    }

    /// Wraps `Workflow::render`.
    ///
    /// Pass `Some` decorator to `proceed` to intercept what the render
    /// function does with its context.
    fn on_render(
        &self,
        session: &WorkflowSession,
        props: Erased,
        state: Erased,
        proceed: RenderProceed<'_>,
    ) -> Erased {
        let _ = session;
        proceed(props, state, None)
    }

    /// Wraps `Workflow::snapshot_state`.
    fn on_snapshot_state(
        &self,
        session: &WorkflowSession,
        state: Erased,
        proceed: SnapshotProceed<'_>,
    ) -> Option<Snapshot> {
        let _ = session;
        proceed(state)
    }

    /// Wraps the whole recursive snapshot of a node and its children.
    fn on_snapshot_state_with_children(
        &self,
        session: &WorkflowSession,
        proceed: TreeSnapshotProceed<'_>,
    ) -> TreeSnapshot {
        let _ = session;
        proceed()
    }

    /// Whether this interceptor never changes anything.
    ///
    /// Nodes skip type erasure entirely for no-op interceptors.
    fn is_noop(&self) -> bool {
        false
    }
}

/// The interceptor that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {
    fn is_noop(&self) -> bool {
        true
    }
}

/// Compose interceptors so the first wraps the rest.
///
/// An empty list is a [`NoopInterceptor`] and a single interceptor is
/// returned as is.
pub fn chained(mut interceptors: Vec<Arc<dyn Interceptor>>) -> Arc<dyn Interceptor> {
    match interceptors.len() {
        0 => Arc::new(NoopInterceptor),
        1 => interceptors.remove(0),
        _ => Arc::new(ChainedInterceptor { interceptors }),
    }
}

/// Two or more interceptors applied in list order.
pub struct ChainedInterceptor {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Interceptor for ChainedInterceptor {
    fn on_session_started(&self, session: &WorkflowSession) {
        for interceptor in &self.interceptors {
            interceptor.on_session_started(session);
        }
    }

    fn on_initial_state(
        &self,
        session: &WorkflowSession,
        props: Erased,
        snapshot: Option<Snapshot>,
        proceed: InitialStateProceed<'_>,
    ) -> Erased {
        initial_state_at(&self.interceptors, session, props, snapshot, proceed)
    }

    fn on_props_changed(
        &self,
        session: &WorkflowSession,
        old: Erased,
        new: Erased,
        state: Erased,
        proceed: PropsChangedProceed<'_>,
    ) -> Erased {
        props_changed_at(&self.interceptors, session, old, new, state, proceed)
    }

    fn on_render(
        &self,
        session: &WorkflowSession,
        props: Erased,
        state: Erased,
        proceed: RenderProceed<'_>,
    ) -> Erased {
        render_at(&self.interceptors, session, props, state, None, proceed)
    }

    fn on_snapshot_state(
        &self,
        session: &WorkflowSession,
        state: Erased,
        proceed: SnapshotProceed<'_>,
    ) -> Option<Snapshot> {
        snapshot_at(&self.interceptors, session, state, proceed)
    }

    fn on_snapshot_state_with_children(
        &self,
        session: &WorkflowSession,
        proceed: TreeSnapshotProceed<'_>,
    ) -> TreeSnapshot {
        tree_snapshot_at(&self.interceptors, session, proceed)
    }

    fn is_noop(&self) -> bool {
        self.interceptors.iter().all(|interceptor| interceptor.is_noop())
    }
}

fn initial_state_at<'a>(
    chain: &'a [Arc<dyn Interceptor>],
    session: &'a WorkflowSession,
    props: Erased,
    snapshot: Option<Snapshot>,
    proceed: InitialStateProceed<'a>,
) -> Erased {
    match chain.split_first() {
        None => proceed(props, snapshot),
        Some((first, rest)) => first.on_initial_state(
            session,
            props,
            snapshot,
            Box::new(move |props: Erased, snapshot: Option<Snapshot>| {
                initial_state_at(rest, session, props, snapshot, proceed)
            }),
        ),
    }
}

fn props_changed_at<'a>(
    chain: &'a [Arc<dyn Interceptor>],
    session: &'a WorkflowSession,
    old: Erased,
    new: Erased,
    state: Erased,
    proceed: PropsChangedProceed<'a>,
) -> Erased {
    match chain.split_first() {
        None => proceed(old, new, state),
        Some((first, rest)) => first.on_props_changed(
            session,
            old,
            new,
            state,
            Box::new(move |old: Erased, new: Erased, state: Erased| {
                props_changed_at(rest, session, old, new, state, proceed)
            }),
        ),
    }
}

fn render_at<'a>(
    chain: &'a [Arc<dyn Interceptor>],
    session: &'a WorkflowSession,
    props: Erased,
    state: Erased,
    outer: Option<Arc<dyn RenderContextInterceptor>>,
    proceed: RenderProceed<'a>,
) -> Erased {
    match chain.split_first() {
        None => proceed(props, state, outer),
        Some((first, rest)) => first.on_render(
            session,
            props,
            state,
            Box::new(move |props: Erased, state: Erased, decorator: Option<Arc<dyn RenderContextInterceptor>>| {
                let composed = compose(outer, decorator);
                render_at(rest, session, props, state, composed, proceed)
            }),
        ),
    }
}

fn snapshot_at<'a>(
    chain: &'a [Arc<dyn Interceptor>],
    session: &'a WorkflowSession,
    state: Erased,
    proceed: SnapshotProceed<'a>,
) -> Option<Snapshot> {
    match chain.split_first() {
        None => proceed(state),
        Some((first, rest)) => first.on_snapshot_state(
            session,
            state,
            Box::new(move |state: Erased| snapshot_at(rest, session, state, proceed)),
        ),
    }
}

fn tree_snapshot_at<'a>(
    chain: &'a [Arc<dyn Interceptor>],
    session: &'a WorkflowSession,
    proceed: TreeSnapshotProceed<'a>,
) -> TreeSnapshot {
    match chain.split_first() {
        None => proceed(),
        Some((first, rest)) => first.on_snapshot_state_with_children(
            session,
            Box::new(move || tree_snapshot_at(rest, session, proceed)),
        ),
    }
}

/// Continuation of [`RenderContextInterceptor::on_action_sent`].
pub type ActionSentProceed<'a> = Box<dyn FnOnce(Erased) + 'a>;

/// Continuation of [`RenderContextInterceptor::on_render_child`]: `props -> rendering`.
pub type RenderChildProceed<'a> = Box<dyn FnOnce(Erased) -> Erased + 'a>;

/// Continuation of [`RenderContextInterceptor::on_running_task`].
pub type RunningTaskProceed<'a> = Box<dyn FnOnce() + 'a>;

/// Continuation of [`RenderContextInterceptor::on_remember`]: `() -> value`.
pub type RememberProceed<'a> = Box<dyn FnOnce() -> Erased + 'a>;

/// Decorates the render context handed to one render pass.
///
/// `session` is always the session of the node doing the rendering.
pub trait RenderContextInterceptor: Send + Sync {
    /// An action is being sent through the node's sink. `action` holds the
    /// `Action<W>`; skipping `proceed` drops it.
    fn on_action_sent(
        &self,
        session: &WorkflowSession,
        name: &str,
        action: Erased,
        proceed: ActionSentProceed<'_>,
    ) {
        let _ = (session, name);
        proceed(action)
    }

    /// A child is being rendered. `props` may be replaced before `proceed`.
    fn on_render_child(
        &self,
        session: &WorkflowSession,
        child: &WorkflowIdentifier,
        key: &str,
        props: Erased,
        proceed: RenderChildProceed<'_>,
    ) -> Erased {
        let _ = (session, child, key);
        proceed(props)
    }

    /// A background task is being declared. Skipping `proceed` declines it.
    fn on_running_task(&self, session: &WorkflowSession, key: &str, proceed: RunningTaskProceed<'_>) {
        let _ = (session, key);
        proceed()
    }

    /// A remembered value is being looked up or computed.
    fn on_remember(
        &self,
        session: &WorkflowSession,
        key: &str,
        result_type: &'static str,
        proceed: RememberProceed<'_>,
    ) -> Erased {
        let _ = (session, key, result_type);
        proceed()
    }
}

/// Nest `inner` inside `outer`.
pub(crate) fn compose(
    outer: Option<Arc<dyn RenderContextInterceptor>>,
    inner: Option<Arc<dyn RenderContextInterceptor>>,
) -> Option<Arc<dyn RenderContextInterceptor>> {
    match (outer, inner) {
        (None, inner) => inner,
        (outer, None) => outer,
        (Some(outer), Some(inner)) => Some(Arc::new(ComposedRenderContextInterceptor { outer, inner })),
    }
}

struct ComposedRenderContextInterceptor {
    outer: Arc<dyn RenderContextInterceptor>,
    inner: Arc<dyn RenderContextInterceptor>,
}

impl RenderContextInterceptor for ComposedRenderContextInterceptor {
    fn on_action_sent(
        &self,
        session: &WorkflowSession,
        name: &str,
        action: Erased,
        proceed: ActionSentProceed<'_>,
    ) {
        self.outer.on_action_sent(
            session,
            name,
            action,
            Box::new(|action: Erased| self.inner.on_action_sent(session, name, action, proceed)),
        )
    }

    fn on_render_child(
        &self,
        session: &WorkflowSession,
        child: &WorkflowIdentifier,
        key: &str,
        props: Erased,
        proceed: RenderChildProceed<'_>,
    ) -> Erased {
        self.outer.on_render_child(
            session,
            child,
            key,
            props,
            Box::new(|props: Erased| self.inner.on_render_child(session, child, key, props, proceed)),
        )
    }

    fn on_running_task(&self, session: &WorkflowSession, key: &str, proceed: RunningTaskProceed<'_>) {
        self.outer.on_running_task(
            session,
            key,
            Box::new(|| self.inner.on_running_task(session, key, proceed)),
        )
    }

    fn on_remember(
        &self,
        session: &WorkflowSession,
        key: &str,
        result_type: &'static str,
        proceed: RememberProceed<'_>,
    ) -> Erased {
        self.outer.on_remember(
            session,
            key,
            result_type,
            Box::new(|| self.inner.on_remember(session, key, result_type, proceed)),
        )
    }
}

/// Recover a concrete value handed back through a hook.
#[track_caller]
pub(crate) fn unerase<T: 'static>(value: Erased, hook: &'static str, session: &WorkflowSession) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => contract_violation(CanopyError::InterceptorTypeMismatch {
            hook,
            expected: type_name::<T>(),
            session: session.to_string(),
        }),
    }
}

/// Logs node lifecycle and sent actions through `tracing`.
///
/// Render passes run inside a `render` span carrying the session, so events
/// logged by render functions are attributed to their node.
#[derive(Clone)]
pub struct TracingInterceptor {
    actions: Arc<dyn RenderContextInterceptor>,
}

impl Default for TracingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingInterceptor {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(ActionTracer),
        }
    }
}

impl Interceptor for TracingInterceptor {
    fn on_session_started(&self, session: &WorkflowSession) {
        debug!(
            session = %session,
            depth = session.depth(),
            parent = ?session.parent().map(|parent| parent.session_id()),
            "workflow session started"
        );
    }

    fn on_render(
        &self,
        session: &WorkflowSession,
        props: Erased,
        state: Erased,
        proceed: RenderProceed<'_>,
    ) -> Erased {
        let span = debug_span!("render", session = %session);
        let _entered = span.enter();
        trace!("render pass starting");
        let rendering = proceed(props, state, Some(self.actions.clone()));
        trace!("render pass finished");
        rendering
    }

    fn on_snapshot_state_with_children(
        &self,
        session: &WorkflowSession,
        proceed: TreeSnapshotProceed<'_>,
    ) -> TreeSnapshot {
        let snapshot = proceed();
        trace!(
            session = %session,
            has_state = snapshot.root().is_some(),
            children = snapshot.children().len(),
            "workflow snapshot taken"
        );
        snapshot
    }
}

struct ActionTracer;

impl RenderContextInterceptor for ActionTracer {
    fn on_action_sent(
        &self,
        session: &WorkflowSession,
        name: &str,
        action: Erased,
        proceed: ActionSentProceed<'_>,
    ) {
        debug!(session = %session, action = name, "action sent");
        proceed(action)
    }
}
