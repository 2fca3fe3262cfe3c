//! Testing utilities for workflow trees.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! canopy = { path = "../canopy", features = ["testing"] }
//! ```
//!
//! # Recording Hook Order
//!
//! ```ignore
//! use canopy::testing::RecordingInterceptor;
//!
//! let outer = RecordingInterceptor::new("outer");
//! let inner = outer.sharing("inner");
//! let mut root = Node::root(
//!     MyWorkflow,
//!     props,
//!     None,
//!     RuntimeConfig::default(),
//!     chained(vec![Arc::new(outer.clone()), Arc::new(inner)]),
//! );
//! root.render(props);
//!
//! assert_eq!(
//!     outer.events_for("render"),
//!     vec!["outer:render:before", "inner:render:before", "inner:render:after", "outer:render:after"],
//! );
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use crate::identity::{WorkflowIdentifier, WorkflowSession};
use crate::interceptor::{
    ActionSentProceed, Erased, InitialStateProceed, Interceptor, PropsChangedProceed,
    RememberProceed, RenderChildProceed, RenderContextInterceptor, RenderProceed,
    RunningTaskProceed, SnapshotProceed, TreeSnapshotProceed,
};
use crate::snapshot::{Snapshot, TreeSnapshot};

/// An interceptor that appends `"{name}:{hook}:before"` and
/// `"{name}:{hook}:after"` to a shared log around every hook.
///
/// Render context hooks record a single `"{name}:{hook}:{key}"` entry.
#[derive(Clone)]
pub struct RecordingInterceptor {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingInterceptor {
    /// A recorder with a fresh log.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A second recorder writing to the same log.
    pub fn sharing(&self, name: &'static str) -> Self {
        Self {
            name,
            log: self.log.clone(),
        }
    }

    /// Append a raw entry, e.g. from inside the intercepted operation.
    pub fn record(&self, entry: impl Into<String>) {
        self.lock_log().push(entry.into());
    }

    /// Every entry so far.
    pub fn events(&self) -> Vec<String> {
        self.lock_log().clone()
    }

    /// Entries mentioning `hook`.
    pub fn events_for(&self, hook: &str) -> Vec<String> {
        let needle = format!(":{hook}:");
        self.lock_log()
            .iter()
            .filter(|entry| entry.contains(&needle))
            .cloned()
            .collect()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.lock_log().clear();
    }

    fn lock_log(&self) -> MutexGuard<'_, Vec<String>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn around<T>(&self, hook: &str, body: impl FnOnce() -> T) -> T {
        self.record(format!("{}:{hook}:before", self.name));
        let result = body();
        self.record(format!("{}:{hook}:after", self.name));
        result
    }
}

impl Interceptor for RecordingInterceptor {
    fn on_session_started(&self, session: &WorkflowSession) {
        self.record(format!(
            "{}:session_started:{}",
            self.name,
            session.identifier()
        ));
    }

    fn on_initial_state(
        &self,
        _session: &WorkflowSession,
        props: Erased,
        snapshot: Option<Snapshot>,
        proceed: InitialStateProceed<'_>,
    ) -> Erased {
        self.around("initial_state", || proceed(props, snapshot))
    }

    fn on_props_changed(
        &self,
        _session: &WorkflowSession,
        old: Erased,
        new: Erased,
        state: Erased,
        proceed: PropsChangedProceed<'_>,
    ) -> Erased {
        self.around("props_changed", || proceed(old, new, state))
    }

    fn on_render(
        &self,
        _session: &WorkflowSession,
        props: Erased,
        state: Erased,
        proceed: RenderProceed<'_>,
    ) -> Erased {
        let decorator: Arc<dyn RenderContextInterceptor> = Arc::new(self.clone());
        self.around("render", || proceed(props, state, Some(decorator)))
    }

    fn on_snapshot_state(
        &self,
        _session: &WorkflowSession,
        state: Erased,
        proceed: SnapshotProceed<'_>,
    ) -> Option<Snapshot> {
        self.around("snapshot_state", || proceed(state))
    }

    fn on_snapshot_state_with_children(
        &self,
        _session: &WorkflowSession,
        proceed: TreeSnapshotProceed<'_>,
    ) -> TreeSnapshot {
        self.around("snapshot_with_children", proceed)
    }
}

impl RenderContextInterceptor for RecordingInterceptor {
    fn on_action_sent(
        &self,
        _session: &WorkflowSession,
        name: &str,
        action: Erased,
        proceed: ActionSentProceed<'_>,
    ) {
        self.record(format!("{}:action_sent:{name}", self.name));
        proceed(action)
    }

    fn on_render_child(
        &self,
        _session: &WorkflowSession,
        _child: &WorkflowIdentifier,
        key: &str,
        props: Erased,
        proceed: RenderChildProceed<'_>,
    ) -> Erased {
        self.record(format!("{}:render_child:{key}", self.name));
        proceed(props)
    }

    fn on_running_task(&self, _session: &WorkflowSession, key: &str, proceed: RunningTaskProceed<'_>) {
        self.record(format!("{}:running_task:{key}", self.name));
        proceed()
    }

    fn on_remember(
        &self,
        _session: &WorkflowSession,
        key: &str,
        _result_type: &'static str,
        proceed: RememberProceed<'_>,
    ) -> Erased {
        self.record(format!("{}:remember:{key}", self.name));
        proceed()
    }
}
