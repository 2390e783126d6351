//! The execution engine: evaluates a built task graph.
//!
//! Two evaluation strategies cover the run modes: sequential (blocking and
//! debug runs; one node at a time on the awaiting task) and concurrent
//! (background runs; nodes are dispatched as soon as their dependencies are
//! met). When a worker client is bound, node invocations are shipped to the
//! provisioned pool instead of running in-process; graph topology and
//! caching semantics are unchanged, only placement differs.

use crate::cache::{Cache, Fingerprint};
use crate::cluster::{TaskInvocation, WorkerClient};
use crate::errors::{DagflowError, Result};
use crate::graph::{CallArgs, TaskFn, TaskGraph, TaskInput, TaskNode, TaskOptions, TaskValue};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How the engine walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Strictly one node at a time, in creation order. Used for blocking
    /// runs and forced by debug mode for deterministic reproduction.
    Sequential,
    /// Nodes run as soon as every input is available; siblings without a
    /// dependency relationship may run concurrently.
    Concurrent,
}

/// Evaluates task graphs against a cache and an optional worker pool.
#[derive(Clone)]
pub struct Engine {
    cache: Arc<Cache>,
    client: Option<Arc<dyn WorkerClient>>,
}

impl Engine {
    /// Creates an engine evaluating nodes in-process.
    #[must_use]
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            client: None,
        }
    }

    /// Dispatches node invocations through the given worker client.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn WorkerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Evaluates the graph and returns the terminal node's value.
    ///
    /// Every node observes completed results from all of its declared
    /// inputs; nodes never referenced by the terminal are not evaluated.
    ///
    /// # Errors
    ///
    /// The first failing node fails the whole evaluation; dependents of a
    /// failed node never run and no partial result is returned.
    pub async fn evaluate(&self, graph: &TaskGraph, mode: EvalMode) -> Result<TaskValue> {
        let results = match mode {
            EvalMode::Sequential => self.evaluate_sequential(graph).await?,
            EvalMode::Concurrent => self.evaluate_concurrent(graph).await?,
        };

        let terminal = graph.terminal();
        let raw = results.get(&terminal.node_index()).ok_or_else(|| {
            DagflowError::Internal("terminal node was never evaluated".to_string())
        })?;
        select_output(
            graph.nodes()[terminal.node_index()].name(),
            raw,
            terminal.output_index(),
        )
    }

    async fn evaluate_sequential(&self, graph: &TaskGraph) -> Result<HashMap<usize, TaskValue>> {
        let reachable = graph.reachable();
        let mut results: HashMap<usize, TaskValue> = HashMap::new();

        // Creation order is a topological order: a node can only reference
        // handles created before it.
        for (index, node) in graph.nodes().iter().enumerate() {
            if !reachable[index] {
                continue;
            }
            let args = resolve_args(node, &results)?;
            let value = self
                .run_node(
                    node.name().to_string(),
                    Arc::clone(&node.func),
                    node.options().clone(),
                    args,
                )
                .await?;
            results.insert(index, value);
        }

        Ok(results)
    }

    async fn evaluate_concurrent(&self, graph: &TaskGraph) -> Result<HashMap<usize, TaskValue>> {
        let reachable = graph.reachable();
        let nodes = graph.nodes();

        // Unique dependencies per reachable node; a node consuming two
        // outputs of the same upstream still waits for it exactly once.
        let mut deps: HashMap<usize, HashSet<usize>> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if !reachable[index] {
                continue;
            }
            let unique: HashSet<usize> = node.input_handles().map(|h| h.node_index()).collect();
            for &dep in &unique {
                dependents.entry(dep).or_default().push(index);
            }
            deps.insert(index, unique);
        }

        let mut in_degree: HashMap<usize, usize> =
            deps.iter().map(|(&index, set)| (index, set.len())).collect();
        let total = in_degree.len();

        let mut results: HashMap<usize, TaskValue> = HashMap::new();
        let mut active: FuturesUnordered<tokio::task::JoinHandle<(usize, Result<TaskValue>)>> =
            FuturesUnordered::new();

        let ready: Vec<usize> = in_degree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&index, _)| index)
            .collect();
        for index in ready {
            active.push(self.spawn_node(index, &nodes[index], &results)?);
        }

        let mut completed = 0;
        while completed < total {
            if active.is_empty() {
                let pending: Vec<&str> = deps
                    .keys()
                    .filter(|index| !results.contains_key(index))
                    .map(|&index| nodes[index].name())
                    .collect();
                return Err(DagflowError::Internal(format!(
                    "deadlocked task graph; remaining tasks: {pending:?}"
                )));
            }

            let Some(joined) = active.next().await else {
                continue;
            };
            let (index, result) =
                joined.map_err(|err| DagflowError::Join(err.to_string()))?;
            // First failure wins; dependents are never scheduled.
            let value = result?;
            results.insert(index, value);
            completed += 1;

            if let Some(children) = dependents.get(&index) {
                for &child in children {
                    if let Some(count) = in_degree.get_mut(&child) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && !results.contains_key(&child) {
                            active.push(self.spawn_node(child, &nodes[child], &results)?);
                        }
                    }
                }
            }
        }

        Ok(results)
    }

    fn spawn_node(
        &self,
        index: usize,
        node: &TaskNode,
        results: &HashMap<usize, TaskValue>,
    ) -> Result<tokio::task::JoinHandle<(usize, Result<TaskValue>)>> {
        let args = resolve_args(node, results)?;
        let engine = self.clone();
        let name = node.name().to_string();
        let func = Arc::clone(&node.func);
        let options = node.options().clone();

        Ok(tokio::spawn(async move {
            (index, engine.run_node(name, func, options, args).await)
        }))
    }

    /// Evaluates one node: consults the cache, and on a miss logs and
    /// invokes the callable locally or through the worker client.
    async fn run_node(
        &self,
        name: String,
        func: TaskFn,
        options: TaskOptions,
        args: CallArgs,
    ) -> Result<TaskValue> {
        let value = if options.cache {
            let fingerprint = Fingerprint::compute(&name, &args)?;
            match self.cache.lookup(&fingerprint)? {
                Some(hit) => {
                    tracing::debug!(task = %name, digest = %fingerprint.digest(), "cache hit");
                    hit
                }
                None => {
                    log_invocation(&name, &options, &args);
                    let value = self
                        .invoke(&name, &func, args)
                        .await
                        .map_err(|err| DagflowError::node_failure(&name, err))?;
                    self.cache.store(&fingerprint, &value)?;
                    value
                }
            }
        } else {
            log_invocation(&name, &options, &args);
            self.invoke(&name, &func, args)
                .await
                .map_err(|err| DagflowError::node_failure(&name, err))?
        };

        validate_outputs(&name, options.output_count, &value)?;
        Ok(value)
    }

    async fn invoke(&self, name: &str, func: &TaskFn, args: CallArgs) -> Result<TaskValue> {
        match &self.client {
            Some(client) => {
                client
                    .submit(TaskInvocation {
                        task: name.to_string(),
                        func: Arc::clone(func),
                        args,
                    })
                    .await
            }
            None => (func)(args),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("remote", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

/// Logs one actual callable invocation. Cache hits are not logged here;
/// they emit a debug-level "cache hit" instead.
fn log_invocation(task: &str, options: &TaskOptions, args: &CallArgs) {
    if options.log_args {
        tracing::info!(
            task = %task,
            positional = ?args.positional,
            keyword = ?args.keyword,
            "calling task"
        );
    } else {
        tracing::info!(task = %task, "calling task");
    }
}

/// Resolves a node's inputs against already-completed results.
fn resolve_args(node: &TaskNode, results: &HashMap<usize, TaskValue>) -> Result<CallArgs> {
    let mut args = CallArgs::new();
    for input in &node.positional {
        args.positional.push(resolve_input(node.name(), input, results)?);
    }
    for (key, input) in &node.keyword {
        args.keyword
            .insert(key.clone(), resolve_input(node.name(), input, results)?);
    }
    Ok(args)
}

fn resolve_input(
    task: &str,
    input: &TaskInput,
    results: &HashMap<usize, TaskValue>,
) -> Result<TaskValue> {
    match input {
        TaskInput::Literal(value) => Ok(value.clone()),
        TaskInput::Node(handle) => {
            let raw = results.get(&handle.node_index()).ok_or_else(|| {
                DagflowError::Internal(format!(
                    "task '{task}' scheduled before its input completed"
                ))
            })?;
            select_output(task, raw, handle.output_index())
        }
    }
}

/// Picks a destructured output out of a raw node result.
fn select_output(task: &str, raw: &TaskValue, output: Option<usize>) -> Result<TaskValue> {
    match output {
        None => Ok(raw.clone()),
        Some(index) => raw
            .as_array()
            .and_then(|values| values.get(index))
            .cloned()
            .ok_or_else(|| DagflowError::NodeEvaluation {
                task: task.to_string(),
                message: format!("output {index} requested from a non-destructurable result"),
            }),
    }
}

/// Enforces the declared output arity against an actual result value.
fn validate_outputs(task: &str, output_count: Option<usize>, value: &TaskValue) -> Result<()> {
    let Some(expected) = output_count else {
        return Ok(());
    };

    let actual = value.as_array().map(Vec::len);
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(DagflowError::NodeEvaluation {
            task: task.to_string(),
            message: match actual {
                Some(actual) => {
                    format!("declared {expected} outputs but the callable returned {actual}")
                }
                None => format!(
                    "declared {expected} outputs but the callable returned a single value"
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, SinkPolicy};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn uncached() -> TaskOptions {
        TaskOptions::new().without_cache()
    }

    fn engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Engine::new(Arc::new(Cache::new(dir.path()))), dir)
    }

    fn add_graph() -> TaskGraph {
        let mut builder = GraphBuilder::new();
        let sum = builder
            .task("add", |args: CallArgs| {
                let a = args.get(0).and_then(TaskValue::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(TaskValue::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })
            .arg(json!(1))
            .arg(json!(1))
            .finish();
        builder.build(sum)
    }

    #[tokio::test]
    async fn test_sequential_evaluates_terminal() {
        let (engine, _dir) = engine();
        let value = engine
            .evaluate(&add_graph(), EvalMode::Sequential)
            .await
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        let (engine, _dir) = engine();
        let sequential = engine
            .evaluate(&add_graph(), EvalMode::Sequential)
            .await
            .unwrap();
        let concurrent = engine
            .evaluate(&add_graph(), EvalMode::Concurrent)
            .await
            .unwrap();
        assert_eq!(sequential, concurrent);
    }

    #[tokio::test]
    async fn test_dependency_chain_observes_inputs() {
        let mut builder = GraphBuilder::new();
        let base = builder
            .task("base", |_| Ok(json!(10)))
            .options(uncached())
            .finish();
        let doubled = builder
            .task("double", |args: CallArgs| {
                let n = args.get(0).and_then(TaskValue::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            })
            .arg(base)
            .options(uncached())
            .finish();
        let graph = builder.build(doubled);

        let (engine, _dir) = engine();
        for mode in [EvalMode::Sequential, EvalMode::Concurrent] {
            assert_eq!(engine.evaluate(&graph, mode).await.unwrap(), json!(20));
        }
    }

    #[tokio::test]
    async fn test_sink_returns_results_in_supply_order() {
        let mut builder = GraphBuilder::new();
        let terminals: Vec<_> = (0..10)
            .map(|a: i64| {
                builder
                    .task(format!("pair{a}"), move |_| Ok(json!(a + (a + 1))))
                    .options(uncached())
                    .finish()
            })
            .collect();
        let sink = builder.sink(terminals, SinkPolicy::ReturnAll);
        let graph = builder.build(sink);

        let (engine, _dir) = engine();
        let value = engine.evaluate(&graph, EvalMode::Concurrent).await.unwrap();
        let values = value.as_array().unwrap();
        assert_eq!(values.len(), 10);
        for (i, value) in values.iter().enumerate() {
            let i = i64::try_from(i).unwrap();
            assert_eq!(value, &json!(i + (i + 1)));
        }
    }

    #[tokio::test]
    async fn test_discard_sink_still_runs_every_terminal() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let mut builder = GraphBuilder::new();
        let terminals: Vec<_> = (0..10)
            .map(|a: i64| {
                builder
                    .task(format!("effect{a}"), move |_| {
                        RUNS.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(a))
                    })
                    .options(uncached())
                    .finish()
            })
            .collect();
        let sink = builder.sink(terminals, SinkPolicy::Discard);
        let graph = builder.build(sink);

        let (engine, _dir) = engine();
        let value = engine.evaluate(&graph, EvalMode::Concurrent).await.unwrap();
        assert_eq!(value, TaskValue::Null);
        assert_eq!(RUNS.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_destructured_outputs_feed_downstream_tasks() {
        let mut builder = GraphBuilder::new();
        let outputs = builder
            .task("split", |_| Ok(json!([3, 4])))
            .options(uncached().with_output_count(2))
            .finish_outputs()
            .unwrap();
        let sum = builder
            .task("sum", |args: CallArgs| {
                let a = args.get(0).and_then(TaskValue::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(TaskValue::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            })
            .arg(outputs[0])
            .arg(outputs[1])
            .options(uncached())
            .finish();
        let graph = builder.build(sum);

        let (engine, _dir) = engine();
        assert_eq!(
            engine.evaluate(&graph, EvalMode::Sequential).await.unwrap(),
            json!(7)
        );
    }

    #[tokio::test]
    async fn test_output_count_mismatch_fails_at_evaluation() {
        let mut builder = GraphBuilder::new();
        let outputs = builder
            .task("claims_three", |_| Ok(json!([1, 2])))
            .options(uncached().with_output_count(3))
            .finish_outputs()
            .unwrap();
        let graph = builder.build(outputs[0]);

        let (engine, _dir) = engine();
        let result = engine.evaluate(&graph, EvalMode::Sequential).await;
        assert!(matches!(result, Err(DagflowError::NodeEvaluation { .. })));
    }

    #[tokio::test]
    async fn test_single_value_declared_multi_fails() {
        let mut builder = GraphBuilder::new();
        let outputs = builder
            .task("scalar", |_| Ok(json!(5)))
            .options(uncached().with_output_count(2))
            .finish_outputs()
            .unwrap();
        let graph = builder.build(outputs[0]);

        let (engine, _dir) = engine();
        let result = engine.evaluate(&graph, EvalMode::Sequential).await;
        assert!(matches!(result, Err(DagflowError::NodeEvaluation { .. })));
    }

    #[tokio::test]
    async fn test_node_failure_fails_the_evaluation() {
        let mut builder = GraphBuilder::new();
        let failing = builder
            .task("explode", |_| {
                Err(DagflowError::Internal("callable raised".to_string()))
            })
            .options(uncached())
            .finish();
        let dependent = builder
            .task("never_runs", |_| Ok(json!(0)))
            .arg(failing)
            .options(uncached())
            .finish();
        let graph = builder.build(dependent);

        let (engine, _dir) = engine();
        for mode in [EvalMode::Sequential, EvalMode::Concurrent] {
            let result = engine.evaluate(&graph, mode).await;
            match result {
                Err(DagflowError::NodeEvaluation { task, .. }) => assert_eq!(task, "explode"),
                other => panic!("expected node failure, got {other:?}"),
            }
        }
    }

    /// Counts emitted "calling task" events on the current thread.
    struct CallLogCounter {
        calls: Arc<AtomicUsize>,
    }

    impl tracing::Subscriber for CallLogCounter {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }

        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            struct Message(String);

            impl tracing::field::Visit for Message {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.0 = format!("{value:?}");
                    }
                }
            }

            let mut message = Message(String::new());
            event.record(&mut message);
            if message.0 == "calling task" {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn enter(&self, _: &tracing::span::Id) {}

        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_log_a_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(CallLogCounter {
            calls: Arc::clone(&calls),
        });

        let build = || {
            let mut builder = GraphBuilder::new();
            let node = builder
                .task("stable", |_| Ok(json!(1)))
                .arg(json!("key"))
                .finish();
            builder.build(node)
        };

        let (engine, _dir) = engine();
        engine.evaluate(&build(), EvalMode::Sequential).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The second evaluation is a cache hit and must not log a call.
        engine.evaluate(&build(), EvalMode::Sequential).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_node_not_reinvoked_across_evaluations() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let build = || {
            let mut builder = GraphBuilder::new();
            let node = builder
                .task("expensive", |_| {
                    CALLS.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(99))
                })
                .arg(json!("fixed"))
                .finish();
            builder.build(node)
        };

        let (engine, _dir) = engine();
        for _ in 0..3 {
            let value = engine.evaluate(&build(), EvalMode::Sequential).await.unwrap();
            assert_eq!(value, json!(99));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
