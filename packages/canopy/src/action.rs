//! Actions: named, one-shot transformations of a node's state.
//!
//! Actions reach a node three ways:
//! - sent through an [`ActionSink`](crate::ActionSink) by an event handler
//! - sent by a background task
//! - produced by the node's output handler for one of its children
//!
//! Applying an action yields an [`ActionApplied`]: whether the state changed,
//! and an optional output for the parent.

use std::borrow::Cow;
use std::fmt;

use anyhow::Result;

use crate::workflow::Workflow;

/// Mutable view handed to an action while it is applied.
pub struct Updater<'a, W: Workflow> {
    props: &'a W::Props,
    /// The state being transformed.
    pub state: W::State,
    output: Option<W::Output>,
}

impl<'a, W: Workflow> Updater<'a, W> {
    /// The props the node was last rendered with.
    pub fn props(&self) -> &W::Props {
        self.props
    }

    /// Report `output` to the parent once this action is applied.
    ///
    /// Setting an output twice keeps the last one.
    pub fn set_output(&mut self, output: W::Output) {
        self.output = Some(output);
    }
}

type ApplyFn<W> = Box<dyn FnOnce(&mut Updater<'_, W>) -> Result<()> + Send>;

/// A named state transformation for workflow `W`.
pub struct Action<W: Workflow> {
    name: Cow<'static, str>,
    apply: ApplyFn<W>,
}

impl<W: Workflow> Action<W> {
    /// Create an action from an infallible transform.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, apply: F) -> Self
    where
        F: FnOnce(&mut Updater<'_, W>) + Send + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(move |updater| {
                apply(updater);
                Ok(())
            }),
        }
    }

    /// Create an action whose transform may fail.
    ///
    /// A failure leaves the node's state untouched and is returned from
    /// action selection as [`CanopyError::ActionFailed`](crate::CanopyError::ActionFailed).
    pub fn try_new<F>(name: impl Into<Cow<'static, str>>, apply: F) -> Self
    where
        F: FnOnce(&mut Updater<'_, W>) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// An action that changes nothing.
    pub fn noop() -> Self {
        Self::new("noop", |_| {})
    }

    /// An action that only reports `output` to the parent.
    pub fn emit(output: W::Output) -> Self {
        Self::new("emit", move |updater| updater.set_output(output))
    }

    /// An action that replaces the state.
    pub fn set_state(state: W::State) -> Self {
        Self::new("set_state", move |updater| updater.state = state)
    }

    /// The action's name, for logging and interception.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_cow(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    /// Apply this action to `state` in place.
    ///
    /// The transform runs against a copy, so a failed action never leaves a
    /// half-written state behind.
    pub(crate) fn apply(
        self,
        props: &W::Props,
        state: &mut W::State,
    ) -> Result<ActionApplied<W::Output>> {
        let mut updater = Updater {
            props,
            state: state.clone(),
            output: None,
        };
        (self.apply)(&mut updater)?;

        let state_changed = updater.state != *state;
        *state = updater.state;
        Ok(ActionApplied {
            output: updater.output,
            state_changed,
        })
    }
}

impl<W: Workflow> fmt::Debug for Action<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The result of applying one action somewhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionApplied<O> {
    /// Output to deliver to the parent (or the host, at the root).
    pub output: Option<O>,
    /// Whether the state of the node, or of any node below it on the path
    /// the action travelled, changed.
    pub state_changed: bool,
}

impl<O> ActionApplied<O> {
    /// An applied action with no output.
    pub fn silent(state_changed: bool) -> Self {
        Self {
            output: None,
            state_changed,
        }
    }
}

/// What a host-level selection step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionProcessingResult<O> {
    /// New props arrived for the root.
    PropsUpdated,
    /// An action was applied somewhere in the tree.
    ActionApplied(ActionApplied<O>),
}

impl<O> ActionProcessingResult<O> {
    /// Whether the next render could differ from the last one.
    pub fn needs_render(&self) -> bool {
        match self {
            ActionProcessingResult::PropsUpdated => true,
            ActionProcessingResult::ActionApplied(applied) => applied.state_changed,
        }
    }

    /// Take the root output, if any.
    pub fn into_output(self) -> Option<O> {
        match self {
            ActionProcessingResult::PropsUpdated => None,
            ActionProcessingResult::ActionApplied(applied) => applied.output,
        }
    }
}
