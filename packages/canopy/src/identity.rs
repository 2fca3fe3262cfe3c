//! Node identity and session metadata.
//!
//! A node is identified within its parent by `(workflow type, render key)`.
//! Reconciliation compares [`NodeId`]s by `TypeId`; snapshots persist the
//! portable [`NodeKey`] form, which uses the workflow's name instead.

use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::workflow::Workflow;

/// Identifies a workflow type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkflowIdentifier {
    type_id: TypeId,
    name: &'static str,
}

impl WorkflowIdentifier {
    /// The identifier of workflow type `W`.
    pub fn of<W: Workflow>() -> Self {
        Self {
            type_id: TypeId::of::<W>(),
            name: W::identifier_name(),
        }
    }

    /// The name used when this identity is persisted.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if this identifies workflow type `W`.
    pub fn is<W: Workflow>(&self) -> bool {
        self.type_id == TypeId::of::<W>()
    }
}

impl fmt::Display for WorkflowIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Identity of a node within its parent: workflow type plus render key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    identifier: WorkflowIdentifier,
    key: String,
}

impl NodeId {
    /// Identity of a `W` rendered under `key`.
    pub fn new<W: Workflow>(key: impl Into<String>) -> Self {
        Self {
            identifier: WorkflowIdentifier::of::<W>(),
            key: key.into(),
        }
    }

    /// The workflow type.
    pub fn identifier(&self) -> &WorkflowIdentifier {
        &self.identifier
    }

    /// The render key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The persisted form of this identity.
    pub fn to_key(&self) -> NodeKey {
        NodeKey::new(self.identifier.name, self.key.clone())
    }
}

/// Persisted form of a [`NodeId`], keyed by workflow name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Persisted workflow name.
    pub workflow: String,
    /// Render key.
    pub key: String,
}

impl NodeKey {
    /// Create a node key.
    pub fn new(workflow: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.workflow, self.key)
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata about one running node, shared with interceptors.
///
/// Session ids are unique within the process and never persisted. The parent
/// link points at the parent's session metadata, not the parent node, so a
/// child can describe its ancestry without owning anything above it.
#[derive(Debug)]
pub struct WorkflowSession {
    id: NodeId,
    session_id: u64,
    parent: Option<Arc<WorkflowSession>>,
    config: RuntimeConfig,
}

impl WorkflowSession {
    pub(crate) fn new(id: NodeId, parent: Option<Arc<WorkflowSession>>, config: RuntimeConfig) -> Self {
        Self {
            id,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            parent,
            config,
        }
    }

    /// The workflow type of this node.
    pub fn identifier(&self) -> &WorkflowIdentifier {
        self.id.identifier()
    }

    /// The key this node was rendered with (empty for the root).
    pub fn render_key(&self) -> &str {
        self.id.key()
    }

    /// The node's identity within its parent.
    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// Process-unique session id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The parent session, if this is not the root.
    pub fn parent(&self) -> Option<&Arc<WorkflowSession>> {
        self.parent.as_ref()
    }

    /// The runtime configuration this node runs under.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of ancestors above this session.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_deref();
        while let Some(session) = cursor {
            depth += 1;
            cursor = session.parent.as_deref();
        }
        depth
    }
}

impl fmt::Display for WorkflowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.key.is_empty() {
            write!(f, "WorkflowSession({}, #{})", self.id.identifier, self.session_id)
        } else {
            write!(
                f,
                "WorkflowSession({}({:?}), #{})",
                self.id.identifier, self.id.key, self.session_id
            )
        }
    }
}
