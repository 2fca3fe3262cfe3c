//! Host loop for a workflow tree.
//!
//! [`WorkflowRunner`] is the synchronous core: render, snapshot, and wait for
//! either new props or the next action. [`render_workflow_in`] spawns the
//! usual loop on tokio and publishes every rendering through a `watch`
//! channel.
//!
//! # Loop
//!
//! ```text
//! render + snapshot ──► publish ──► wait for props or action ──┐
//!        ▲                                                       │
//!        └──── skip if nothing changed (RenderOnlyWhenStateChanges)
//!              drain ready actions first (ConflateStaleRenderings)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::action::{ActionApplied, ActionProcessingResult};
use crate::config::{RuntimeConfig, RuntimeOption};
use crate::error::CanopyError;
use crate::interceptor::{chained, Interceptor};
use crate::node::Node;
use crate::snapshot::TreeSnapshot;
use crate::work_stealing::Dispatch;
use crate::workflow::Workflow;

/// A rendering together with the snapshot taken right after it.
#[derive(Debug, Clone)]
pub struct RenderingAndSnapshot<R> {
    pub rendering: R,
    pub snapshot: TreeSnapshot,
}

/// Drives the root node of one tree.
pub struct WorkflowRunner<W: Workflow> {
    root: Node<W>,
    props: W::Props,
    /// `None` once the props sender has gone away.
    props_rx: Option<watch::Receiver<W::Props>>,
    config: RuntimeConfig,
}

impl<W: Workflow> WorkflowRunner<W> {
    /// Create the root node from the current value of `props`.
    pub fn new(
        workflow: W,
        props_rx: watch::Receiver<W::Props>,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        Self::start(workflow, props_rx, snapshot, config, interceptors, None)
    }

    /// Like [`WorkflowRunner::new`], with background tasks polled through
    /// `dispatch` instead of the current tokio runtime.
    pub fn with_dispatch(
        workflow: W,
        props_rx: watch::Receiver<W::Props>,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self::start(workflow, props_rx, snapshot, config, interceptors, Some(dispatch))
    }

    fn start(
        workflow: W,
        mut props_rx: watch::Receiver<W::Props>,
        snapshot: Option<TreeSnapshot>,
        config: RuntimeConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
        dispatch: Option<Arc<dyn Dispatch>>,
    ) -> Self {
        let props = props_rx.borrow_and_update().clone();
        let root = Node::root_in(
            workflow,
            props.clone(),
            snapshot,
            config.clone(),
            chained(interceptors),
            dispatch,
        );
        info!(root = %root.session(), config = %config, "workflow runtime starting");
        Self {
            root,
            props,
            props_rx: Some(props_rx),
            config,
        }
    }

    /// The root node.
    pub fn root(&self) -> &Node<W> {
        &self.root
    }

    /// Render the whole tree with the latest props and snapshot it.
    pub fn next_rendering(&mut self) -> RenderingAndSnapshot<W::Rendering> {
        let rendering = self.root.render(self.props.clone());
        RenderingAndSnapshot {
            rendering,
            snapshot: self.root.snapshot(),
        }
    }

    /// Wait for new props or the next action in the tree, props first.
    ///
    /// With `wait` false, returns `Ok(None)` instead of waiting when nothing
    /// is ready.
    pub async fn process_action(
        &mut self,
        wait: bool,
    ) -> Result<Option<ActionProcessingResult<W::Output>>, CanopyError> {
        if !wait {
            return self.try_process_action();
        }

        loop {
            tokio::select! {
                biased;
                props = next_props(&mut self.props_rx) => match props {
                    Some(props) => {
                        self.props = props;
                        return Ok(Some(ActionProcessingResult::PropsUpdated));
                    }
                    None => {
                        debug!("props sender dropped, keeping last props");
                        self.props_rx = None;
                    }
                },
                applied = self.root.select_next_action() => {
                    return Ok(Some(ActionProcessingResult::ActionApplied(applied?)));
                }
            }
        }
    }

    fn try_process_action(&mut self) -> Result<Option<ActionProcessingResult<W::Output>>, CanopyError> {
        if let Some(rx) = self.props_rx.as_mut() {
            match rx.has_changed() {
                Ok(true) => {
                    self.props = rx.borrow_and_update().clone();
                    return Ok(Some(ActionProcessingResult::PropsUpdated));
                }
                Ok(false) => {}
                Err(_) => self.props_rx = None,
            }
        }

        self.root
            .try_next_action()
            .transpose()
            .map(|applied| applied.map(ActionProcessingResult::ActionApplied))
    }

    /// Cancel the whole tree.
    pub fn cancel(&mut self) {
        self.root.cancel();
    }

    fn conflates(&self) -> bool {
        self.config.contains(RuntimeOption::ConflateStaleRenderings)
    }

    fn renders_only_on_change(&self) -> bool {
        self.config.contains(RuntimeOption::RenderOnlyWhenStateChanges)
    }
}

async fn next_props<P: Clone>(rx: &mut Option<watch::Receiver<P>>) -> Option<P> {
    match rx {
        Some(receiver) => match receiver.changed().await {
            Ok(()) => Some(receiver.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Handle to a tree running under [`render_workflow_in`].
pub struct RenderLoop<R, O> {
    /// The latest rendering and snapshot.
    pub renderings: watch::Receiver<RenderingAndSnapshot<R>>,
    /// Outputs emitted by the root, in order.
    pub outputs: mpsc::UnboundedReceiver<O>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), CanopyError>>,
}

impl<R, O> RenderLoop<R, O> {
    /// Ask the loop to stop and cancel the tree.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the loop to finish. Panics from render functions resume here.
    pub async fn join(self) -> Result<(), CanopyError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Ok(()),
        }
    }
}

/// Run `workflow` as the root of a new tree on the current tokio runtime.
///
/// The first rendering is produced before this returns. The loop stops when
/// [`RenderLoop::shutdown`] is called or an action fails; either way the
/// tree is cancelled.
pub fn render_workflow_in<W>(
    workflow: W,
    props: watch::Receiver<W::Props>,
    snapshot: Option<TreeSnapshot>,
    config: RuntimeConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
) -> RenderLoop<W::Rendering, W::Output>
where
    W: Workflow,
    W::Props: Sync,
    W::Rendering: Sync,
{
    let mut runner = WorkflowRunner::new(workflow, props, snapshot, config, interceptors);
    let (renderings_tx, renderings) = watch::channel(runner.next_rendering());
    let (outputs_tx, outputs) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        let result = run_loop(&mut runner, &renderings_tx, &outputs_tx, &token).await;
        runner.cancel();
        if let Err(err) = &result {
            debug!(error = %err, "workflow runtime stopped");
        }
        result
    });

    RenderLoop {
        renderings,
        outputs,
        shutdown,
        handle,
    }
}

async fn run_loop<W: Workflow>(
    runner: &mut WorkflowRunner<W>,
    renderings: &watch::Sender<RenderingAndSnapshot<W::Rendering>>,
    outputs: &mpsc::UnboundedSender<W::Output>,
    shutdown: &CancellationToken,
) -> Result<(), CanopyError> {
    loop {
        let processed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            processed = runner.process_action(true) => processed?,
        };
        let Some(mut result) = processed else {
            continue;
        };

        let mut needs_render = result.needs_render();
        if runner.conflates() {
            while !has_output(&result) {
                match runner.process_action(false).await? {
                    Some(next) => {
                        needs_render |= next.needs_render();
                        result = next;
                    }
                    None => break,
                }
            }
        }

        if needs_render || !runner.renders_only_on_change() {
            renderings.send_replace(runner.next_rendering());
        } else {
            trace!("nothing changed, skipping render");
        }

        if let Some(output) = result.into_output() {
            // The host may have stopped listening.
            let _ = outputs.send(output);
        }
    }
}

fn has_output<O>(result: &ActionProcessingResult<O>) -> bool {
    matches!(
        result,
        ActionProcessingResult::ActionApplied(ActionApplied {
            output: Some(_),
            ..
        })
    )
}
