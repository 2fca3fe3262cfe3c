//! Background tasks owned by a node.
//!
//! A task is declared by key during render and started once the pass has
//! frozen. It is polled through the tree's [`Dispatch`], or the current tokio
//! runtime when the tree has none, raced against its own cancellation token,
//! which is a child of the owning node's token. Cancelling the node, or rendering
//! without declaring the key again, cancels the token and the task future is
//! dropped the next time it is polled.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::action::Action;
use crate::context::ActionSink;
use crate::error::{contract_violation, CanopyError};
use crate::identity::WorkflowSession;
use crate::work_stealing::{spawn_on, Dispatch};
use crate::workflow::Workflow;

type TaskStarter = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Bookkeeping for one declared task.
pub(crate) struct TaskRecord {
    key: String,
    token: CancellationToken,
    pending: Option<TaskStarter>,
}

impl TaskRecord {
    pub(crate) fn new<W, F, Fut>(key: String, sink: ActionSink<W>, parent: &CancellationToken, body: F) -> Self
    where
        W: Workflow,
        F: FnOnce(TaskScope<W>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let scope = TaskScope {
            sink,
            token: token.clone(),
        };
        Self {
            key,
            token,
            pending: Some(Box::new(move || Box::pin(body(scope)))),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Spawn the task if this is its first committed pass.
    pub(crate) fn start_if_pending(&mut self, session: &WorkflowSession, dispatch: Option<&Arc<dyn Dispatch>>) {
        let Some(start) = self.pending.take() else {
            return;
        };
        if self.token.is_cancelled() {
            return;
        }

        let dispatch = match dispatch {
            Some(dispatch) => dispatch.clone(),
            None => match tokio::runtime::Handle::try_current() {
                Ok(handle) => Arc::new(handle) as Arc<dyn Dispatch>,
                Err(_) => contract_violation(CanopyError::NoDispatcher {
                    key: self.key.clone(),
                    session: session.to_string(),
                }),
            },
        };

        trace!(session = %session, task = %self.key, "starting background task");
        let token = self.token.clone();
        let future = start();
        spawn_on(dispatch, async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    pub(crate) fn cancel(&self, session: &WorkflowSession) {
        if !self.token.is_cancelled() {
            trace!(session = %session, task = %self.key, "cancelling background task");
            self.token.cancel();
        }
    }
}

/// What a background task can do: send actions to its node and observe
/// cancellation.
pub struct TaskScope<W: Workflow> {
    sink: ActionSink<W>,
    token: CancellationToken,
}

impl<W: Workflow> TaskScope<W> {
    /// Queue `action` on the owning node.
    pub fn send(&self, action: Action<W>) {
        self.sink.send(action);
    }

    /// A sink that outlives this scope, e.g. for handing to a callback.
    pub fn sink(&self) -> ActionSink<W> {
        self.sink.clone()
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The task's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
