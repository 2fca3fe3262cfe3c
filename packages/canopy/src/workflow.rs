//! The workflow trait: the pure logic behind a class of nodes.
//!
//! A workflow never holds runtime state itself. The runtime creates a
//! [`Node`](crate::Node) for every place a workflow is rendered, and the node
//! owns the state, the children and the background tasks; the workflow just
//! describes how to derive, render and persist that state.
//!
//! # Example
//!
//! ```ignore
//! use canopy::{Action, RenderContext, Snapshot, Workflow};
//!
//! struct Counter;
//!
//! impl Workflow for Counter {
//!     type Props = i32;
//!     type State = i32;
//!     type Output = ();
//!     type Rendering = String;
//!
//!     fn initial_state(&self, props: &i32, snapshot: Option<&Snapshot>) -> i32 {
//!         snapshot.and_then(|s| s.to_i32().ok()).unwrap_or(*props)
//!     }
//!
//!     fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &i32, state: &i32) -> String {
//!         let increment = ctx.event_handler("increment", |u, ()| u.state += 1);
//!         format!("count: {state}")
//!     }
//!
//!     fn snapshot_state(&self, state: &i32) -> Option<Snapshot> {
//!         Some(Snapshot::of_i32(*state))
//!     }
//! }
//! ```

use crate::context::RenderContext;
use crate::snapshot::Snapshot;

/// The logic of one kind of node.
///
/// # Guarantees
///
/// - `render` is called synchronously, never concurrently with itself for
///   the same node
/// - `initial_state` is called once per node, before its first render
/// - state only changes through actions, `on_props_changed`, or restoration
pub trait Workflow: Send + Sync + Sized + 'static {
    /// Input handed down by the parent on every render.
    type Props: Clone + PartialEq + Send + 'static;

    /// Private state owned by each node.
    ///
    /// Equality decides whether an action changed anything.
    type State: Clone + PartialEq + Send + 'static;

    /// Values reported to the parent through its output handler.
    type Output: Send + 'static;

    /// The value `render` produces. Opaque to the runtime.
    type Rendering: Clone + Send + 'static;

    /// Derive the first state of a new node.
    ///
    /// `snapshot` is the state persisted by [`Workflow::snapshot_state`] when
    /// the node is being restored, or `None` for a fresh node.
    fn initial_state(&self, props: &Self::Props, snapshot: Option<&Snapshot>) -> Self::State;

    /// Derive a new state when the parent renders with different props.
    fn on_props_changed(
        &self,
        old: &Self::Props,
        new: &Self::Props,
        state: Self::State,
    ) -> Self::State {
        let _ = (old, new);
        state
    }

    /// Produce this node's rendering.
    ///
    /// Children, background tasks and memoized values are declared through
    /// `ctx` on every pass; anything not declared again is torn down when the
    /// pass commits.
    fn render(
        &self,
        ctx: &mut RenderContext<'_, Self>,
        props: &Self::Props,
        state: &Self::State,
    ) -> Self::Rendering;

    /// Persist the state, or `None` if it should be re-derived from props.
    fn snapshot_state(&self, state: &Self::State) -> Option<Snapshot> {
        let _ = state;
        None
    }

    /// Name used for this workflow in persisted snapshots.
    ///
    /// Defaults to the Rust type name. Override it to keep snapshots readable
    /// across renames.
    fn identifier_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
