//! Task graph construction.
//!
//! A [`GraphBuilder`] turns individual callables into [`TaskNode`]s and wires
//! them into a DAG by passing one node's handle as another node's input.
//! Nothing is evaluated here; evaluation is deferred entirely to the
//! execution engine.

use super::node::{CallArgs, TaskFn, TaskHandle, TaskInput, TaskNode, TaskOptions, TaskValue};
use crate::errors::{DagflowError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a sink node treats the terminal results it fans in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPolicy {
    /// Return every terminal result as an ordered list matching the order
    /// the terminals were supplied.
    ReturnAll,
    /// Return nothing, but still act as a completion fence: every terminal
    /// must have run before the sink produces its (null) result.
    Discard,
}

/// Builder that assembles task nodes into a [`TaskGraph`].
///
/// Acyclicity is guaranteed by construction: a task may only consume handles
/// the builder has already returned, never a handle for a node still being
/// defined.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<TaskNode>,
}

impl GraphBuilder {
    /// Creates an empty graph builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts wrapping a callable into a task node.
    ///
    /// The returned [`TaskBuilder`] collects inputs and options; the node is
    /// added to the graph when `finish` (or `finish_outputs`) is called.
    pub fn task<F>(&mut self, name: impl Into<String>, func: F) -> TaskBuilder<'_>
    where
        F: Fn(CallArgs) -> Result<TaskValue> + Send + Sync + 'static,
    {
        TaskBuilder {
            graph: self,
            name: name.into(),
            func: Arc::new(func),
            positional: Vec::new(),
            keyword: BTreeMap::new(),
            options: TaskOptions::default(),
        }
    }

    /// Adds a sink node fanning the given terminals into one output.
    ///
    /// With [`SinkPolicy::ReturnAll`] the sink's result is a list whose i-th
    /// element is the i-th terminal's result; with [`SinkPolicy::Discard`]
    /// the result is null. Either way the sink depends on every terminal,
    /// so all of them complete before the sink does.
    pub fn sink(&mut self, terminals: Vec<TaskHandle>, policy: SinkPolicy) -> TaskHandle {
        let func: TaskFn = Arc::new(move |args: CallArgs| {
            Ok(match policy {
                SinkPolicy::ReturnAll => TaskValue::Array(args.positional),
                SinkPolicy::Discard => TaskValue::Null,
            })
        });

        let node = TaskNode {
            name: "sink".to_string(),
            func,
            positional: terminals.into_iter().map(TaskInput::from).collect(),
            keyword: BTreeMap::new(),
            // A sink only reorders already-computed values.
            options: TaskOptions::new().without_cache(),
        };

        self.push(node)
    }

    /// Finalizes the graph with the given terminal node.
    #[must_use]
    pub fn build(self, terminal: TaskHandle) -> TaskGraph {
        TaskGraph {
            nodes: self.nodes,
            terminal,
        }
    }

    /// Number of nodes added so far.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, node: TaskNode) -> TaskHandle {
        let index = self.nodes.len();
        self.nodes.push(node);
        TaskHandle {
            node: index,
            output: None,
        }
    }
}

/// Fluent sub-builder for a single task node.
#[must_use = "a task is only added to the graph when finish() is called"]
pub struct TaskBuilder<'a> {
    graph: &'a mut GraphBuilder,
    name: String,
    func: TaskFn,
    positional: Vec<TaskInput>,
    keyword: BTreeMap<String, TaskInput>,
    options: TaskOptions,
}

impl TaskBuilder<'_> {
    /// Appends a positional input: a literal value or another node's handle.
    pub fn arg(mut self, input: impl Into<TaskInput>) -> Self {
        self.positional.push(input.into());
        self
    }

    /// Appends several positional inputs at once.
    pub fn args<I, T>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskInput>,
    {
        self.positional.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Adds a keyword input.
    pub fn kwarg(mut self, key: impl Into<String>, input: impl Into<TaskInput>) -> Self {
        self.keyword.insert(key.into(), input.into());
        self
    }

    /// Replaces the wrapping options.
    pub fn options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds the node to the graph and returns its handle.
    pub fn finish(self) -> TaskHandle {
        let node = TaskNode {
            name: self.name,
            func: self.func,
            positional: self.positional,
            keyword: self.keyword,
            options: self.options,
        };
        self.graph.push(node)
    }

    /// Adds the node and returns one handle per declared output.
    ///
    /// # Errors
    ///
    /// Returns [`DagflowError::GraphConstruction`] when the options do not
    /// declare an `output_count`.
    pub fn finish_outputs(self) -> Result<Vec<TaskHandle>> {
        let count = self
            .options
            .output_count
            .ok_or_else(|| DagflowError::GraphConstruction {
                task: self.name.clone(),
                message: "finish_outputs requires options.with_output_count".to_string(),
            })?;

        let handle = self.finish();
        Ok((0..count)
            .map(|index| TaskHandle {
                node: handle.node,
                output: Some(index),
            })
            .collect())
    }
}

/// An immutable DAG of task nodes with a single designated terminal.
///
/// Produced once per `build()` call; a pipeline re-run rebuilds the graph
/// from scratch.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    terminal: TaskHandle,
}

impl TaskGraph {
    /// The designated terminal handle whose value is the graph's result.
    #[must_use]
    pub const fn terminal(&self) -> TaskHandle {
        self.terminal
    }

    /// Number of nodes in the graph, reachable or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes, indexed by handle.
    #[must_use]
    pub(crate) fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Marks the nodes reachable from the terminal. Unreachable nodes are
    /// never evaluated.
    #[must_use]
    pub(crate) fn reachable(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![self.terminal.node];

        while let Some(index) = stack.pop() {
            if reachable[index] {
                continue;
            }
            reachable[index] = true;
            stack.extend(self.nodes[index].input_handles().map(|h| h.node));
        }

        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: i64) -> impl Fn(CallArgs) -> Result<TaskValue> + Send + Sync {
        move |_| Ok(json!(value))
    }

    #[test]
    fn test_builder_issues_sequential_handles() {
        let mut builder = GraphBuilder::new();
        let a = builder.task("a", constant(1)).finish();
        let b = builder.task("b", constant(2)).arg(a).finish();

        assert_eq!(a.node_index(), 0);
        assert_eq!(b.node_index(), 1);
        assert_eq!(builder.node_count(), 2);
    }

    #[test]
    fn test_finish_outputs_requires_count() {
        let mut builder = GraphBuilder::new();
        let result = builder.task("multi", constant(0)).finish_outputs();
        assert!(matches!(
            result,
            Err(DagflowError::GraphConstruction { .. })
        ));
    }

    #[test]
    fn test_finish_outputs_indexes_each_output() {
        let mut builder = GraphBuilder::new();
        let handles = builder
            .task("split", |_| Ok(json!([1, 2, 3])))
            .options(TaskOptions::new().with_output_count(3))
            .finish_outputs()
            .unwrap();

        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| h.node_index() == 0));
        assert_eq!(handles[2].output_index(), Some(2));
    }

    #[test]
    fn test_reachability_skips_unreferenced_nodes() {
        let mut builder = GraphBuilder::new();
        let a = builder.task("a", constant(1)).finish();
        let _orphan = builder.task("orphan", constant(9)).finish();
        let b = builder.task("b", constant(2)).arg(a).finish();
        let graph = builder.build(b);

        let reachable = graph.reachable();
        assert_eq!(reachable, vec![true, false, true]);
    }

    #[test]
    fn test_sink_depends_on_all_terminals() {
        let mut builder = GraphBuilder::new();
        let handles: Vec<_> = (0..4)
            .map(|i| builder.task(format!("t{i}"), constant(i)).finish())
            .collect();
        let sink = builder.sink(handles, SinkPolicy::ReturnAll);
        let graph = builder.build(sink);

        assert!(graph.reachable().iter().all(|&r| r));
        assert_eq!(graph.nodes()[sink.node_index()].input_handles().count(), 4);
    }
}
