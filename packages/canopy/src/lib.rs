//! # Canopy
//!
//! A runtime for trees of reactive state machines. Each node renders a value
//! for its parent, reacts to actions, persists its state and reports outputs
//! upward; the tree reshapes itself every time a parent renders.
//!
//! ## Core Concepts
//!
//! - [`Workflow`] = the pure logic of one kind of node: initial state, render,
//!   snapshot, reaction to new props
//! - [`Node`] = a running instance of a workflow, owning its state, its
//!   children and its background tasks
//! - [`Action`] = a named state transformation, optionally producing an output
//!   for the parent
//!
//! ## Architecture
//!
//! ```text
//! host ──props──► root Node ──render──► rendering ──► host
//!                   │    ▲
//!        render_child    │ output ─► parent handler ─► parent Action
//!                   ▼    │
//!                child Node ──running_task──► task ────────send──┐
//!                   ▲                                            │
//!                   └────────────── action queue ◄───────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Identity is `(workflow type, key)`** - a child rendered under the same
//!    identity in consecutive passes is the same node, wherever it appears
//! 2. **Unrendered means gone** - children, tasks and remembered values not
//!    declared by a pass are torn down when it commits
//! 3. **Render is frozen** - sinks handed out by a pass may only be written
//!    once the pass has returned
//! 4. **Cancellation flows down** - cancelling a node cancels its whole
//!    subtree before `cancel` returns
//! 5. **Changes are sticky** - a state change anywhere on an action's path is
//!    reported all the way to the root
//!
//! ## Example
//!
//! ```ignore
//! use canopy::{render_workflow_in, Action, RenderContext, RuntimeConfig, Snapshot, Workflow};
//!
//! struct Counter;
//!
//! impl Workflow for Counter {
//!     type Props = ();
//!     type State = u32;
//!     type Output = ();
//!     type Rendering = (u32, canopy::EventHandler<()>);
//!
//!     fn initial_state(&self, _props: &(), snapshot: Option<&Snapshot>) -> u32 {
//!         snapshot.and_then(|s| s.to_i32().ok()).map_or(0, |n| n as u32)
//!     }
//!
//!     fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), state: &u32) -> Self::Rendering {
//!         (*state, ctx.event_handler("increment", |u, ()| u.state += 1))
//!     }
//! }
//!
//! let (_props_tx, props_rx) = tokio::sync::watch::channel(());
//! let render_loop = render_workflow_in(Counter, props_rx, None, RuntimeConfig::default(), vec![]);
//! let (count, increment) = render_loop.renderings.borrow().rendering.clone();
//! increment.call(());
//! ```

mod action;
mod config;
mod context;
mod error;
mod identity;
mod interceptor;
mod node;
mod runtime;
mod snapshot;
mod staging;
mod subtree;
mod task;
mod workflow;

// Work-stealing dispatch for hosts that drain work synchronously
pub mod work_stealing;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Tree scenario tests (test-only)
#[cfg(test)]
mod tree_tests;

pub use crate::action::{Action, ActionApplied, ActionProcessingResult, Updater};
pub use crate::config::{ConfigError, RuntimeConfig, RuntimeOption, RUNTIME_OPTIONS_ENV};
pub use crate::context::{ActionSink, EventHandler, RenderContext, RenderTrigger};
pub use crate::error::CanopyError;
pub use crate::identity::{NodeId, NodeKey, WorkflowIdentifier, WorkflowSession};
pub use crate::interceptor::{
    chained, ActionSentProceed, ChainedInterceptor, Erased, InitialStateProceed, Interceptor,
    NoopInterceptor, PropsChangedProceed, RememberProceed, RenderChildProceed,
    RenderContextInterceptor, RenderProceed, RunningTaskProceed, SnapshotProceed,
    TracingInterceptor, TreeSnapshotProceed,
};
pub use crate::node::Node;
pub use crate::runtime::{render_workflow_in, RenderLoop, RenderingAndSnapshot, WorkflowRunner};
pub use crate::snapshot::{Snapshot, SnapshotError, TreeSnapshot};
pub use crate::staging::ActiveStagingList;
pub use crate::task::TaskScope;
pub use crate::work_stealing::{Dispatch, ManualDispatch, WorkStealingDispatcher};
pub use crate::workflow::Workflow;
