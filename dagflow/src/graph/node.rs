//! Task node primitives: values, callables, options and handles.

use crate::errors::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The dynamic value passed between tasks.
pub type TaskValue = serde_json::Value;

/// A deferred callable wrapped into a graph node.
pub type TaskFn = Arc<dyn Fn(CallArgs) -> Result<TaskValue> + Send + Sync>;

/// Resolved call arguments for one task invocation.
///
/// Keyword arguments live in a `BTreeMap` so their serialization, and hence
/// the cache fingerprint derived from it, is deterministic.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// Positional argument values, in declaration order.
    pub positional: Vec<TaskValue>,
    /// Keyword argument values, ordered by key.
    pub keyword: BTreeMap<String, TaskValue>,
}

impl CallArgs {
    /// Creates empty call arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the positional argument at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TaskValue> {
        self.positional.get(index)
    }

    /// Returns the keyword argument named `key`, if present.
    #[must_use]
    pub fn kwarg(&self, key: &str) -> Option<&TaskValue> {
        self.keyword.get(key)
    }
}

/// Options controlling how a callable is wrapped into a task node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Route the invocation through the cache (default: true).
    pub cache: bool,
    /// Log the literal arguments on every invocation (default: false).
    /// The task name is always logged regardless.
    pub log_args: bool,
    /// Number of independent outputs the callable produces. `None` means a
    /// single opaque value; `Some(n)` means the return value is destructured
    /// into exactly `n` outputs at evaluation time.
    pub output_count: Option<usize>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            cache: true,
            log_args: false,
            output_count: None,
        }
    }
}

impl TaskOptions {
    /// Creates the default options (cached, name-only logging, one output).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables result caching for this task.
    #[must_use]
    pub const fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Enables argument logging for this task.
    #[must_use]
    pub const fn with_log_args(mut self) -> Self {
        self.log_args = true;
        self
    }

    /// Declares how many outputs the callable returns.
    #[must_use]
    pub const fn with_output_count(mut self, count: usize) -> Self {
        self.output_count = Some(count);
        self
    }
}

/// A handle to a task node that was already added to a graph.
///
/// Handles are only ever issued for nodes that exist, so composing handles
/// can never form a cycle: a node may consume handles created before it,
/// never one referring to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) node: usize,
    pub(crate) output: Option<usize>,
}

impl TaskHandle {
    /// Index of the node this handle refers to.
    #[must_use]
    pub const fn node_index(&self) -> usize {
        self.node
    }

    /// Which destructured output this handle selects, if any.
    #[must_use]
    pub const fn output_index(&self) -> Option<usize> {
        self.output
    }
}

/// One input to a task node: either a literal value or another node's
/// (future) output.
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// A literal value available at build time.
    Literal(TaskValue),
    /// The deferred output of a previously created node.
    Node(TaskHandle),
}

impl From<TaskHandle> for TaskInput {
    fn from(handle: TaskHandle) -> Self {
        Self::Node(handle)
    }
}

impl From<TaskValue> for TaskInput {
    fn from(value: TaskValue) -> Self {
        Self::Literal(value)
    }
}

/// A single node in a task graph: a deferred, optionally cached invocation
/// of a callable with fixed inputs. Never evaluated at build time and never
/// mutated after creation.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) name: String,
    pub(crate) func: TaskFn,
    pub(crate) positional: Vec<TaskInput>,
    pub(crate) keyword: BTreeMap<String, TaskInput>,
    pub(crate) options: TaskOptions,
}

impl TaskNode {
    /// The task's qualified name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapping options for this node.
    #[must_use]
    pub const fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Iterates over the node handles this node consumes.
    pub(crate) fn input_handles(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.positional
            .iter()
            .chain(self.keyword.values())
            .filter_map(|input| match input {
                TaskInput::Node(handle) => Some(*handle),
                TaskInput::Literal(_) => None,
            })
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("positional", &self.positional)
            .field("keyword", &self.keyword)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_defaults() {
        let options = TaskOptions::new();
        assert!(options.cache);
        assert!(!options.log_args);
        assert_eq!(options.output_count, None);
    }

    #[test]
    fn test_options_builder() {
        let options = TaskOptions::new()
            .without_cache()
            .with_log_args()
            .with_output_count(3);

        assert!(!options.cache);
        assert!(options.log_args);
        assert_eq!(options.output_count, Some(3));
    }

    #[test]
    fn test_input_conversions() {
        let literal: TaskInput = json!(42).into();
        assert!(matches!(literal, TaskInput::Literal(_)));

        let handle = TaskHandle {
            node: 0,
            output: None,
        };
        let input: TaskInput = handle.into();
        assert!(matches!(input, TaskInput::Node(_)));
    }

    #[test]
    fn test_call_args_access() {
        let mut args = CallArgs::new();
        args.positional.push(json!(1));
        args.keyword.insert("mode".to_string(), json!("fast"));

        assert_eq!(args.get(0), Some(&json!(1)));
        assert_eq!(args.kwarg("mode"), Some(&json!("fast")));
        assert_eq!(args.kwarg("missing"), None);
    }
}
