//! Structured error types for canopy.
//!
//! Two kinds of failure exist in a workflow tree:
//!
//! - **Contract violations** are bugs in a render function: rendering two
//!   children under the same identity, registering a task key twice, sending
//!   an action while the render pass that produced the sink is still running.
//!   These are never recovered. They are logged and raised as a panic at the
//!   call site, carrying the node's identity so the bug can be localized.
//! - **Runtime errors** come out of action selection: an action's transform
//!   failed, or the node was already cancelled. These are returned as
//!   [`CanopyError`] from [`Node::select_next_action`](crate::Node::select_next_action)
//!   and the host loop; the core never retries or isolates them.
//!
//! # Error Example
//!
//! ```ignore
//! match runner.process_action(true).await {
//!     Ok(Some(result)) => handle(result),
//!     Ok(None) => {}
//!     Err(CanopyError::ActionFailed { action, source, .. }) => {
//!         tracing::error!(%action, error = ?source, "workflow action failed");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::borrow::Cow;

use thiserror::Error;
use tracing::error;

/// Structured error type for canopy operations.
#[derive(Debug, Error)]
pub enum CanopyError {
    /// Two `render_child` calls in one pass used the same identity.
    #[error("duplicate child {workflow} with key {key:?} rendered by {parent}")]
    DuplicateChild {
        /// Name of the child workflow type.
        workflow: &'static str,
        /// The colliding render key.
        key: String,
        /// Description of the rendering parent session.
        parent: String,
    },

    /// Two `running_task` calls in one pass used the same key.
    #[error("duplicate task key {key:?} registered by {session}")]
    DuplicateTask {
        /// The colliding task key.
        key: String,
        /// Description of the rendering session.
        session: String,
    },

    /// Two `remember` calls in one pass used the same key, type and inputs.
    #[error("duplicate remember key {key:?} for {result_type} in {session}")]
    DuplicateRemember {
        /// The colliding remember key.
        key: String,
        /// Name of the remembered value's type.
        result_type: &'static str,
        /// Description of the rendering session.
        session: String,
    },

    /// An action sink was written to before its render pass returned.
    #[error("action {action:?} sent to {session} while it was still rendering")]
    SendDuringRender {
        /// Name of the offending action.
        action: Cow<'static, str>,
        /// Description of the rendering session.
        session: String,
    },

    /// A background task was declared in a tree with no dispatcher, rendered
    /// outside a tokio runtime.
    #[error("task {key:?} in {session} has no dispatcher to run on and no tokio runtime is active")]
    NoDispatcher {
        /// The task's key.
        key: String,
        /// Description of the rendering session.
        session: String,
    },

    /// An interceptor returned a value of a different type than the hook expects.
    #[error("interceptor hook {hook} returned a value that is not {expected} in {session}")]
    InterceptorTypeMismatch {
        /// The hook that produced the bad value.
        hook: &'static str,
        /// The type the runtime expected.
        expected: &'static str,
        /// Description of the session being intercepted.
        session: String,
    },

    /// Action selection was attempted on a cancelled node.
    #[error("{session} was cancelled")]
    Cancelled {
        /// Description of the cancelled session.
        session: String,
    },

    /// An action's transform returned an error.
    #[error("action {action:?} failed in {session}: {source}")]
    ActionFailed {
        /// Name of the failed action.
        action: Cow<'static, str>,
        /// Description of the session the action targeted.
        session: String,
        /// The error returned by the transform.
        #[source]
        source: anyhow::Error,
    },
}

impl CanopyError {
    /// Returns true for errors that indicate a bug in a render function.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(
            self,
            CanopyError::Cancelled { .. } | CanopyError::ActionFailed { .. }
        )
    }
}

/// Report a render-time contract violation and abort the render pass.
#[track_caller]
pub(crate) fn contract_violation(err: CanopyError) -> ! {
    error!(error = %err, "workflow contract violation");
    panic!("{err}");
}
