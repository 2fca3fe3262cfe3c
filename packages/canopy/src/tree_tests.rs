//! Scenario tests for whole workflow trees.
//!
//! These exercise reconciliation, propagation, snapshots, interceptors and
//! cancellation across several nodes at once.

#[cfg(test)]
mod tree_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::action::{Action, ActionApplied, ActionProcessingResult, Updater};
    use crate::config::{RuntimeConfig, RuntimeOption};
    use crate::context::{ActionSink, RenderContext};
    use crate::interceptor::{chained, Interceptor, NoopInterceptor};
    use crate::node::Node;
    use crate::runtime::WorkflowRunner;
    use crate::snapshot::{Snapshot, TreeSnapshot};
    use crate::testing::RecordingInterceptor;
    use crate::work_stealing::{ManualDispatch, WorkStealingDispatcher};
    use crate::workflow::Workflow;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Wait until `done` holds, yielding to spawned tasks in between.
    async fn settle(done: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ==========================================================================
    // Test Workflows
    // ==========================================================================

    /// Renders one `Leaf` per key in its props.
    struct Forest;

    impl Workflow for Forest {
        type Props = Vec<String>;
        type State = ();
        type Output = ();
        type Rendering = Vec<(String, u64)>;

        fn initial_state(&self, _props: &Vec<String>, _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, keys: &Vec<String>, _state: &()) -> Vec<(String, u64)> {
            keys.iter()
                .map(|key| (key.clone(), ctx.render_child_ignoring_output(Leaf, (), key)))
                .collect()
        }
    }

    /// Renders its own session id, so node identity is observable.
    struct Leaf;

    impl Workflow for Leaf {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = u64;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) -> u64 {
            ctx.session().session_id()
        }
    }

    /// Renders one `Sapling` per key; each sapling keeps a task running.
    struct Grove {
        renders: Arc<Mutex<Vec<String>>>,
        drops: Arc<AtomicUsize>,
    }

    impl Workflow for Grove {
        type Props = Vec<String>;
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &Vec<String>, _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, keys: &Vec<String>, _state: &()) {
            for key in keys {
                let sapling = Sapling {
                    renders: self.renders.clone(),
                    drops: self.drops.clone(),
                };
                ctx.render_child_ignoring_output(sapling, (), key);
            }
        }
    }

    struct Sapling {
        renders: Arc<Mutex<Vec<String>>>,
        drops: Arc<AtomicUsize>,
    }

    impl Workflow for Sapling {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            self.renders
                .lock()
                .unwrap()
                .push(ctx.session().render_key().to_string());
            let drops = self.drops.clone();
            ctx.running_task("grow", move |_scope| {
                let guard = DropCounter(drops);
                async move {
                    let _guard = guard;
                    std::future::pending::<()>().await
                }
            });
        }
    }

    /// Three levels deep; the bottom hands its sink all the way up.
    struct Top;
    struct Middle;
    struct Bottom;

    impl Workflow for Top {
        type Props = ();
        type State = u8;
        type Output = ();
        type Rendering = ActionSink<Bottom>;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> u8 {
            0
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &u8) -> ActionSink<Bottom> {
            ctx.render_child_ignoring_output(Middle, (), "middle")
        }
    }

    impl Workflow for Middle {
        type Props = ();
        type State = u8;
        type Output = ();
        type Rendering = ActionSink<Bottom>;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> u8 {
            0
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &u8) -> ActionSink<Bottom> {
            ctx.render_child_ignoring_output(Bottom, (), "bottom")
        }
    }

    impl Workflow for Bottom {
        type Props = ();
        type State = u8;
        type Output = ();
        type Rendering = ActionSink<Bottom>;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> u8 {
            0
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &u8) -> ActionSink<Bottom> {
            ctx.action_sink()
        }
    }

    /// Renders the same child identity twice.
    struct Twins;

    impl Workflow for Twins {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            ctx.render_child_ignoring_output(Leaf, (), "same");
            ctx.render_child_ignoring_output(Leaf, (), "same");
        }
    }

    /// Reuses one key for two different workflow types.
    struct Mixed;

    impl Workflow for Mixed {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            ctx.render_child_ignoring_output(Leaf, (), "shared");
            ctx.render_child_ignoring_output(Bottom, (), "shared");
        }
    }

    #[derive(Clone)]
    struct LedgerView {
        total: i32,
        sink: ActionSink<Ledger>,
        notes: Vec<(String, String, ActionSink<Note>)>,
    }

    impl LedgerView {
        fn values(&self) -> (i32, Vec<(String, String)>) {
            let notes = self
                .notes
                .iter()
                .map(|(key, text, _)| (key.clone(), text.clone()))
                .collect();
            (self.total, notes)
        }
    }

    /// A persisted total with one persisted `Note` per key.
    struct Ledger;

    impl Workflow for Ledger {
        type Props = Vec<String>;
        type State = i32;
        type Output = ();
        type Rendering = LedgerView;

        fn initial_state(&self, _props: &Vec<String>, snapshot: Option<&Snapshot>) -> i32 {
            snapshot.and_then(|s| s.to_i32().ok()).unwrap_or(0)
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, keys: &Vec<String>, state: &i32) -> LedgerView {
            let notes = keys
                .iter()
                .map(|key| {
                    let (text, sink) = ctx.render_child_ignoring_output(Note, (), key);
                    (key.clone(), text, sink)
                })
                .collect();
            LedgerView {
                total: *state,
                sink: ctx.action_sink(),
                notes,
            }
        }

        fn snapshot_state(&self, state: &i32) -> Option<Snapshot> {
            Some(Snapshot::of_i32(*state))
        }
    }

    struct Note;

    impl Workflow for Note {
        type Props = ();
        type State = String;
        type Output = ();
        type Rendering = (String, ActionSink<Note>);

        fn initial_state(&self, _props: &(), snapshot: Option<&Snapshot>) -> String {
            snapshot
                .and_then(|s| s.to_str().ok().map(String::from))
                .unwrap_or_default()
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), state: &String) -> (String, ActionSink<Note>) {
            (state.clone(), ctx.action_sink())
        }

        fn snapshot_state(&self, state: &String) -> Option<Snapshot> {
            Some(Snapshot::of_str(state))
        }
    }

    /// Records its own render body into a shared interceptor log.
    struct Echo {
        log: RecordingInterceptor,
    }

    impl Workflow for Echo {
        type Props = i32;
        type State = i32;
        type Output = ();
        type Rendering = i32;

        fn initial_state(&self, props: &i32, _snapshot: Option<&Snapshot>) -> i32 {
            *props
        }

        fn render(&self, _ctx: &mut RenderContext<'_, Self>, _props: &i32, state: &i32) -> i32 {
            self.log.record("workflow:render:body");
            *state
        }
    }

    /// Root of the output scenario: its handler turns "done" into state 1.
    struct Parent;
    struct Child;

    impl Workflow for Parent {
        type Props = ();
        type State = i32;
        type Output = String;
        type Rendering = (i32, String, ActionSink<Child>);

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> i32 {
            0
        }

        fn render(
            &self,
            ctx: &mut RenderContext<'_, Self>,
            _props: &(),
            state: &i32,
        ) -> (i32, String, ActionSink<Child>) {
            let (text, sink) = ctx.render_child(Child, (), "child", |output: String| {
                Action::new("child finished", move |u: &mut Updater<'_, Parent>| {
                    if output == "done" {
                        u.state = 1;
                    }
                })
            });
            (*state, text, sink)
        }
    }

    impl Workflow for Child {
        type Props = ();
        type State = String;
        type Output = String;
        type Rendering = (String, ActionSink<Child>);

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> String {
            "x".to_string()
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), state: &String) -> (String, ActionSink<Child>) {
            (state.clone(), ctx.action_sink())
        }
    }

    type TokenSlot = Arc<Mutex<Option<oneshot::Sender<CancellationToken>>>>;

    /// Owns a `Worker` whose task reports its cancellation token once started.
    struct Host {
        tokens: TokenSlot,
    }

    struct Worker {
        tokens: TokenSlot,
    }

    impl Workflow for Host {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            let worker = Worker {
                tokens: self.tokens.clone(),
            };
            ctx.render_child_ignoring_output(worker, (), "worker");
        }
    }

    impl Workflow for Worker {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            let tokens = self.tokens.clone();
            ctx.running_task("work", move |scope| async move {
                let sender = tokens.lock().unwrap().take();
                if let Some(sender) = sender {
                    let _ = sender.send(scope.token().clone());
                }
                scope.cancelled().await;
            });
        }
    }

    /// Declares the same task key twice.
    struct DoubleBooked;

    impl Workflow for DoubleBooked {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) {
            ctx.running_task("poll", |_scope| async {});
            ctx.running_task("poll", |_scope| async {});
        }
    }

    /// Keeps one task for as long as it is rendered, whatever the props.
    struct Ticker {
        starts: Arc<AtomicUsize>,
    }

    impl Workflow for Ticker {
        type Props = u32;
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &u32, _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &u32, _state: &()) {
            let starts = self.starts.clone();
            ctx.running_task("tick", move |_scope| async move {
                starts.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await
            });
        }
    }

    /// Declares its task only while the props say so.
    struct Toggle {
        drops: Arc<AtomicUsize>,
    }

    impl Workflow for Toggle {
        type Props = bool;
        type State = ();
        type Output = ();
        type Rendering = ();

        fn initial_state(&self, _props: &bool, _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, enabled: &bool, _state: &()) {
            if *enabled {
                let drops = self.drops.clone();
                ctx.running_task("job", move |_scope| {
                    let guard = DropCounter(drops);
                    async move {
                        let _guard = guard;
                        std::future::pending::<()>().await
                    }
                });
            }
        }
    }

    type Applied = Arc<Mutex<Vec<&'static str>>>;

    /// Renders branches "a" then "b" and hands out every sink.
    struct Orchard;

    struct Branch;

    impl Workflow for Orchard {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = (ActionSink<Orchard>, ActionSink<Branch>, ActionSink<Branch>);

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(
            &self,
            ctx: &mut RenderContext<'_, Self>,
            _props: &(),
            _state: &(),
        ) -> (ActionSink<Orchard>, ActionSink<Branch>, ActionSink<Branch>) {
            let a = ctx.render_child_ignoring_output(Branch, (), "a");
            let b = ctx.render_child_ignoring_output(Branch, (), "b");
            (ctx.action_sink(), a, b)
        }
    }

    impl Workflow for Branch {
        type Props = ();
        type State = ();
        type Output = ();
        type Rendering = ActionSink<Branch>;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) {}

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), _state: &()) -> ActionSink<Branch> {
            ctx.action_sink()
        }
    }

    fn logging<W: Workflow>(applied: &Applied, label: &'static str) -> Action<W> {
        let applied = applied.clone();
        Action::new(label, move |_u: &mut Updater<'_, W>| applied.lock().unwrap().push(label))
    }

    /// Counts task starts and reports each start back to its node.
    struct Beacon {
        starts: Arc<AtomicUsize>,
    }

    impl Workflow for Beacon {
        type Props = ();
        type State = u32;
        type Output = ();
        type Rendering = u32;

        fn initial_state(&self, _props: &(), _snapshot: Option<&Snapshot>) -> u32 {
            0
        }

        fn render(&self, ctx: &mut RenderContext<'_, Self>, _props: &(), state: &u32) -> u32 {
            let starts = self.starts.clone();
            ctx.running_task("beacon", move |scope| async move {
                starts.fetch_add(1, Ordering::SeqCst);
                scope.send(Action::new("beacon lit", |u: &mut Updater<'_, Beacon>| u.state += 1));
            });
            *state
        }
    }

    fn manual_beacon(starts: &Arc<AtomicUsize>) -> (Node<Beacon>, WorkStealingDispatcher) {
        let dispatcher = WorkStealingDispatcher::new(ManualDispatch::new());
        let root = Node::root_with_dispatch(
            Beacon {
                starts: starts.clone(),
            },
            (),
            None,
            RuntimeConfig::default(),
            Arc::new(NoopInterceptor),
            Arc::new(dispatcher.clone()),
        );
        (root, dispatcher)
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    // ==========================================================================
    // TEST: Reconciliation keeps nodes by identity, not by position
    // ==========================================================================

    fn key_sets() -> impl Strategy<Value = Vec<String>> {
        proptest::sample::subsequence(vec!["a", "b", "c", "d", "e"], 0..=5)
            .prop_shuffle()
            .prop_map(|names| names.into_iter().map(String::from).collect())
    }

    proptest! {
        #[test]
        fn test_children_keep_identity_across_passes(first in key_sets(), second in key_sets()) {
            let mut root = Node::new_root(Forest, first.clone());
            let before: HashMap<String, u64> = root.render(first).into_iter().collect();
            let after: HashMap<String, u64> = root.render(second.clone()).into_iter().collect();

            for key in &second {
                match before.get(key) {
                    Some(id) => {
                        prop_assert_eq!(after[key], *id);
                    }
                    None => {
                        prop_assert!(!before.values().any(|id| *id == after[key]));
                    }
                }
            }
            prop_assert_eq!(root.child_count(), second.len());
        }
    }

    #[test]
    fn test_same_key_different_workflow_types_are_distinct_children() {
        let mut root = Node::new_root(Mixed, ());
        root.render(());
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    #[should_panic(expected = "duplicate child")]
    fn test_duplicate_child_identity_panics() {
        let mut root = Node::new_root(Twins, ());
        root.render(());
    }

    // ==========================================================================
    // TEST: Dropped children are torn down exactly once
    // ==========================================================================

    #[tokio::test]
    async fn test_dropped_child_is_cancelled_once_and_not_rendered_again() {
        init_tracing();
        let renders = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));
        let mut root = Node::new_root(
            Grove {
                renders: renders.clone(),
                drops: drops.clone(),
            },
            keys(&["a", "b"]),
        );

        root.render(keys(&["a", "b"]));
        assert_eq!(root.child_count(), 2);

        root.render(keys(&["a"]));
        assert_eq!(root.child_count(), 1);
        settle(|| drops.load(Ordering::SeqCst) >= 1).await;

        root.render(keys(&["a"]));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        let renders = renders.lock().unwrap().clone();
        assert_eq!(renders.iter().filter(|key| *key == "b").count(), 1);
        assert_eq!(renders.iter().filter(|key| *key == "a").count(), 3);
    }

    // ==========================================================================
    // TEST: State changes deep in the tree reach the root
    // ==========================================================================

    #[test]
    fn test_state_change_at_leaf_is_seen_by_root() {
        let mut root = Node::new_root(Top, ());
        let sink = root.render(());

        sink.send(Action::noop());
        assert_eq!(root.try_next_action().unwrap().unwrap(), ActionApplied::silent(false));

        sink.send(Action::set_state(1));
        let applied = root.try_next_action().unwrap().unwrap();
        assert_eq!(applied, ActionApplied::silent(true));
        assert_eq!(*root.state(), 0);
    }

    #[test]
    fn test_state_change_at_leaf_is_seen_by_root_with_partial_rendering() {
        let mut root = Node::root(
            Top,
            (),
            None,
            RuntimeConfig::new().with(RuntimeOption::PartialTreeRendering),
            Arc::new(NoopInterceptor),
        );
        let sink = root.render(());

        sink.send(Action::set_state(7));
        let applied = root.try_next_action().unwrap().unwrap();
        assert!(applied.state_changed);
        assert!(applied.output.is_none());
    }

    // ==========================================================================
    // TEST: Ready sources are selected children first, then own queue, then trigger
    // ==========================================================================

    #[test]
    fn test_ready_sources_are_selected_in_fixed_order() {
        let applied: Applied = Arc::new(Mutex::new(Vec::new()));
        let mut root = Node::new_root(Orchard, ());
        let (own, a, b) = root.render(());

        own.send(logging(&applied, "own"));
        b.send(logging(&applied, "b"));
        a.send(logging(&applied, "a"));
        root.render_trigger().request_render();

        for _ in 0..3 {
            root.try_next_action().unwrap().unwrap();
        }
        assert_eq!(*applied.lock().unwrap(), vec!["a", "b", "own"]);

        let last = root.try_next_action().unwrap().unwrap();
        assert_eq!(last, ActionApplied::silent(true));
        assert_eq!(applied.lock().unwrap().len(), 3);
        assert!(root.try_next_action().is_none());
    }

    // ==========================================================================
    // TEST: Output from a child is absorbed by the parent's handler
    // ==========================================================================

    #[test]
    fn test_child_output_updates_parent_and_stops_there() {
        let mut root = Node::new_root(Parent, ());
        let (count, text, sink) = root.render(());
        assert_eq!((count, text.as_str()), (0, "x"));

        sink.send(Action::new("finish", |u| {
            u.state = "y".to_string();
            u.set_output("done".to_string());
        }));

        let applied = root.try_next_action().unwrap().unwrap();
        assert_eq!(applied, ActionApplied::silent(true));
        assert!(root.try_next_action().is_none());

        let (count, text, _) = root.render(());
        assert_eq!(count, 1);
        assert_eq!(text, "y");
    }

    // ==========================================================================
    // TEST: Snapshots restore an identical tree
    // ==========================================================================

    proptest! {
        #[test]
        fn test_snapshot_restores_identical_renderings(
            ops in prop::collection::vec((0usize..4, -50i32..50), 0..12)
        ) {
            let names = keys(&["n0", "n1", "n2"]);
            let mut root = Node::new_root(Ledger, names.clone());
            let mut view = root.render(names.clone());

            for (target, delta) in ops {
                if target == 0 {
                    view.sink.send(Action::new("add", move |u| u.state += delta));
                } else {
                    let (_, _, sink) = &view.notes[target - 1];
                    sink.send(Action::new("append", move |u: &mut Updater<'_, Note>| {
                        u.state.push_str(&delta.to_string())
                    }));
                }
                while let Some(result) = root.try_next_action() {
                    result.unwrap();
                }
                view = root.render(names.clone());
            }

            let bytes = root.snapshot().to_bytes();
            let parsed = TreeSnapshot::parse(&bytes).unwrap();
            let mut restored = Node::root(
                Ledger,
                names.clone(),
                Some(parsed),
                RuntimeConfig::default(),
                Arc::new(NoopInterceptor),
            );

            prop_assert_eq!(restored.render(names.clone()).values(), root.render(names).values());
        }
    }

    // ==========================================================================
    // TEST: Interceptors wrap in list order
    // ==========================================================================

    #[test]
    fn test_interceptors_wrap_render_in_list_order() {
        let outer = RecordingInterceptor::new("i1");
        let inner = outer.sharing("i2");
        let mut root = Node::root(
            Echo { log: outer.clone() },
            3,
            None,
            RuntimeConfig::default(),
            chained(vec![Arc::new(outer.clone()) as Arc<dyn Interceptor>, Arc::new(inner)]),
        );

        assert_eq!(root.render(3), 3);
        assert_eq!(
            outer.events_for("render"),
            vec![
                "i1:render:before",
                "i2:render:before",
                "workflow:render:body",
                "i2:render:after",
                "i1:render:after",
            ]
        );
        assert_eq!(
            outer.events_for("initial_state"),
            vec![
                "i1:initial_state:before",
                "i2:initial_state:before",
                "i2:initial_state:after",
                "i1:initial_state:after",
            ]
        );
    }

    #[test]
    fn test_render_context_decorators_see_children_outer_first() {
        let outer = RecordingInterceptor::new("i1");
        let inner = outer.sharing("i2");
        let mut root = Node::root(
            Parent,
            (),
            None,
            RuntimeConfig::default(),
            chained(vec![Arc::new(outer.clone()) as Arc<dyn Interceptor>, Arc::new(inner)]),
        );

        let (_, text, sink) = root.render(());
        assert_eq!(text, "x");
        assert_eq!(
            outer.events_for("render_child"),
            vec!["i1:render_child:child", "i2:render_child:child"]
        );

        sink.send(Action::new("finish", |u| u.set_output("done".to_string())));
        assert_eq!(
            outer.events_for("action_sent"),
            vec!["i1:action_sent:finish", "i2:action_sent:finish"]
        );
        let applied = root.try_next_action().unwrap().unwrap();
        assert!(applied.state_changed);
        assert_eq!(root.render(()).0, 1);
    }

    // ==========================================================================
    // TEST: Background tasks follow their declarations
    // ==========================================================================

    #[tokio::test]
    async fn test_cancelling_root_reaches_child_task_before_returning() {
        init_tracing();
        let (tx, rx) = oneshot::channel();
        let mut root = Node::new_root(
            Host {
                tokens: Arc::new(Mutex::new(Some(tx))),
            },
            (),
        );
        root.render(());

        let token = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("worker task never started")
            .unwrap();
        assert!(!token.is_cancelled());

        root.cancel();
        assert!(token.is_cancelled());
        assert!(root.is_cancelled());
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    #[should_panic(expected = "duplicate task key")]
    fn test_duplicate_task_key_panics() {
        let mut root = Node::new_root(DoubleBooked, ());
        root.render(());
    }

    #[tokio::test]
    async fn test_task_is_not_restarted_by_later_passes() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut root = Node::new_root(
            Ticker {
                starts: starts.clone(),
            },
            0,
        );

        for pass in 0..3 {
            root.render(pass);
            settle(|| starts.load(Ordering::SeqCst) >= 1).await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undeclared_task_is_cancelled() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut root = Node::new_root(
            Toggle {
                drops: drops.clone(),
            },
            true,
        );

        root.render(true);
        tokio::task::yield_now().await;
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        root.render(false);
        settle(|| drops.load(Ordering::SeqCst) == 1).await;

        root.render(false);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // TEST: Hosts without a tokio runtime drive tasks through a dispatcher
    // ==========================================================================

    #[test]
    fn test_task_runs_when_host_drains_dispatcher() {
        let starts = Arc::new(AtomicUsize::new(0));
        let (mut root, dispatcher) = manual_beacon(&starts);

        assert_eq!(root.render(()), 0);
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(root.try_next_action().is_none());

        assert!(dispatcher.advance_until_idle() >= 1);
        assert!(dispatcher.is_idle());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let applied = root.try_next_action().unwrap().unwrap();
        assert!(applied.state_changed);
        assert_eq!(root.render(()), 1);

        dispatcher.advance_until_idle();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_cancelled_before_drain_never_runs() {
        let starts = Arc::new(AtomicUsize::new(0));
        let (mut root, dispatcher) = manual_beacon(&starts);

        root.render(());
        root.cancel();
        dispatcher.advance_until_idle();

        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn test_runner_with_dispatch_applies_task_actions() {
        let starts = Arc::new(AtomicUsize::new(0));
        let dispatcher = WorkStealingDispatcher::new(ManualDispatch::new());
        let (_props_tx, props_rx) = tokio::sync::watch::channel(());
        let mut runner = WorkflowRunner::with_dispatch(
            Beacon {
                starts: starts.clone(),
            },
            props_rx,
            None,
            RuntimeConfig::default(),
            vec![],
            Arc::new(dispatcher.clone()),
        );

        assert_eq!(runner.next_rendering().rendering, 0);
        dispatcher.advance_until_idle();

        let processed = futures::executor::block_on(runner.process_action(false)).unwrap();
        assert!(matches!(
            processed,
            Some(ActionProcessingResult::ActionApplied(ActionApplied {
                state_changed: true,
                ..
            }))
        ));
        assert_eq!(runner.next_rendering().rendering, 1);
    }

    #[test]
    #[should_panic(expected = "no dispatcher")]
    fn test_task_outside_runtime_without_dispatcher_panics() {
        let mut root = Node::new_root(
            Beacon {
                starts: Arc::new(AtomicUsize::new(0)),
            },
            (),
        );
        root.render(());
    }
}
