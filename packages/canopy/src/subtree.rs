//! Ownership and reconciliation of a node's children.
//!
//! Children of different workflow types live in one list as
//! `Box<dyn ChildSlot<P>>`. Reconciliation only ever compares [`NodeId`]s;
//! a matched slot is downcast back to its concrete [`ChildNode`] to be
//! rendered with the new props.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::Action;
use crate::error::{contract_violation, CanopyError};
use crate::identity::{NodeId, NodeKey, WorkflowSession};
use crate::node::{Node, NodeEnv, NodeResult};
use crate::snapshot::TreeSnapshot;
use crate::staging::ActiveStagingList;
use crate::workflow::Workflow;

/// Maps a child's output into an action for parent `P`.
pub(crate) type OutputHandler<C, P> =
    Box<dyn Fn(<C as Workflow>::Output) -> Action<P> + Send + Sync>;

/// What selecting on one child produced, from the parent's point of view.
pub(crate) enum ChildResult<P: Workflow> {
    /// The child escorted a result upward. `action` is the child's output
    /// translated by the parent's handler, if there was an output.
    Propagated {
        action: Option<Action<P>>,
        state_changed: bool,
    },
    /// The child absorbed the result.
    Settled { state_changed: bool },
}

/// One child of a `P` node, whatever its own workflow type.
pub(crate) trait ChildSlot<P: Workflow>: Send {
    fn id(&self) -> &NodeId;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn poll_child(&mut self, cx: &mut Context<'_>) -> Poll<Result<ChildResult<P>, CanopyError>>;
    fn snapshot(&self) -> TreeSnapshot;
    fn cancel(&mut self);
    fn is_idle(&self) -> bool;
}

/// A child node plus the handler for its outputs.
pub(crate) struct ChildNode<C: Workflow, P: Workflow> {
    id: NodeId,
    node: Node<C>,
    handler: OutputHandler<C, P>,
}

impl<C: Workflow, P: Workflow> ChildSlot<P> for ChildNode<C, P> {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn poll_child(&mut self, cx: &mut Context<'_>) -> Poll<Result<ChildResult<P>, CanopyError>> {
        let result = ready!(self.node.poll_step(cx))?;
        Poll::Ready(Ok(match result {
            NodeResult::Propagate(applied) => ChildResult::Propagated {
                action: applied.output.map(|output| (self.handler)(output)),
                state_changed: applied.state_changed,
            },
            NodeResult::Settled { state_changed } => ChildResult::Settled { state_changed },
        }))
    }

    fn snapshot(&self) -> TreeSnapshot {
        self.node.snapshot()
    }

    fn cancel(&mut self) {
        self.node.cancel();
    }

    fn is_idle(&self) -> bool {
        self.node.is_idle()
    }
}

/// Owns the children of one `P` node.
pub(crate) struct SubtreeManager<P: Workflow> {
    children: ActiveStagingList<Box<dyn ChildSlot<P>>>,
    /// Child snapshots to seed first-time construction, until the first commit.
    snapshot_cache: Option<HashMap<NodeKey, TreeSnapshot>>,
    session: Arc<WorkflowSession>,
    token: CancellationToken,
    env: NodeEnv,
}

impl<P: Workflow> SubtreeManager<P> {
    pub(crate) fn new(
        session: Arc<WorkflowSession>,
        token: CancellationToken,
        env: NodeEnv,
        snapshot_cache: Option<HashMap<NodeKey, TreeSnapshot>>,
    ) -> Self {
        Self {
            children: ActiveStagingList::new(),
            snapshot_cache,
            session,
            token,
            env,
        }
    }

    /// Render the child identified by `(C, key)`, creating it on first use.
    pub(crate) fn render_child<C: Workflow>(
        &mut self,
        child: C,
        props: C::Props,
        key: &str,
        handler: OutputHandler<C, P>,
    ) -> C::Rendering {
        let id = NodeId::new::<C>(key);
        if self.children.staged().iter().any(|slot| slot.id() == &id) {
            contract_violation(CanopyError::DuplicateChild {
                workflow: id.identifier().name(),
                key: key.to_string(),
                parent: self.session.to_string(),
            });
        }

        if let Some(slot) = self.children.retain(|slot| slot.id() == &id) {
            // The identity carries `C`'s TypeId, so a match is always a `ChildNode<C, P>`.
            let Some(existing) = slot.as_any_mut().downcast_mut::<ChildNode<C, P>>() else {
                unreachable!("child {} matched by identity but holds another workflow type", id.to_key());
            };
            existing.handler = handler;
            existing.node.set_workflow(child);
            return existing.node.render(props);
        }

        let snapshot = self
            .snapshot_cache
            .as_mut()
            .and_then(|cache| cache.remove(&id.to_key()));
        let mut node = Node::new(
            id.clone(),
            child,
            props.clone(),
            snapshot,
            Some(&self.session),
            self.token.child_token(),
            self.env.clone(),
        );
        let rendering = node.render(props);
        self.children.stage(Box::new(ChildNode { id, node, handler }));
        rendering
    }

    /// Tear down every child the finished pass did not render.
    pub(crate) fn commit(&mut self) {
        let parent = &self.session;
        self.children.commit_staging(|mut slot| {
            debug!(parent = %parent, child = %slot.id().to_key(), "dropping child no longer rendered");
            slot.cancel();
        });
        self.snapshot_cache = None;
    }

    /// Poll every child in render order; the first ready child wins.
    pub(crate) fn poll_children(&mut self, cx: &mut Context<'_>) -> Poll<Result<ChildResult<P>, CanopyError>> {
        for slot in self.children.active_mut() {
            if let Poll::Ready(result) = slot.poll_child(cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }

    /// Snapshots of every child, in render order.
    pub(crate) fn snapshot_children(&self) -> Vec<(NodeKey, TreeSnapshot)> {
        self.children
            .active()
            .iter()
            .map(|slot| (slot.id().to_key(), slot.snapshot()))
            .collect()
    }

    pub(crate) fn cancel_all(&mut self) {
        for mut slot in self.children.drain_all() {
            slot.cancel();
        }
        self.snapshot_cache = None;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.children.active().iter().all(|slot| slot.is_idle())
    }

    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }
}
