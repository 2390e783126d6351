//! Error types for the dagflow framework.
//!
//! The taxonomy distinguishes construction-time failures (surfaced
//! synchronously from `run()`) from evaluation-time failures (carried by the
//! evaluation handle in background mode).

use std::path::PathBuf;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DagflowError>;

/// The main error type for dagflow operations.
#[derive(Debug, Error)]
pub enum DagflowError {
    /// `Pipeline::build` was not overridden by a concrete pipeline.
    #[error("Pipeline::build is not implemented for pipeline '{pipeline}'")]
    BuildNotImplemented {
        /// The pipeline name.
        pipeline: String,
    },

    /// The cache persistence backend cannot be read or written.
    ///
    /// Cached tasks never fall back to uncached execution; callers may rely
    /// on "cache hit means the callable is not re-invoked" for side-effecting
    /// tasks.
    #[error("cache unavailable at '{path}': {source}")]
    CacheUnavailable {
        /// Cache location that could not be used.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A task graph was assembled incorrectly.
    #[error("invalid task '{task}': {message}")]
    GraphConstruction {
        /// The task being added.
        task: String,
        /// What went wrong.
        message: String,
    },

    /// The cluster backend rejected or could not satisfy the requested
    /// configuration. Never retried; no partial cluster state is retained.
    #[error("cluster provisioning failed: {0}")]
    Provisioning(String),

    /// The graph rendering toolchain is missing.
    #[error("graph renderer unavailable: the 'dot' executable was not found")]
    RenderingUnavailable,

    /// A wrapped callable failed during graph evaluation.
    #[error("task '{task}' failed: {message}")]
    NodeEvaluation {
        /// The task whose evaluation failed.
        task: String,
        /// The failure description.
        message: String,
    },

    /// The log relay could not be set up.
    #[error("log relay error: {0}")]
    Relay(String),

    /// A background evaluation was lost before producing a result.
    #[error("background evaluation lost: {0}")]
    Join(String),

    /// An invariant the scheduler relies on was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DagflowError {
    /// Creates a node evaluation failure for the given task.
    ///
    /// An already-wrapped [`DagflowError::NodeEvaluation`] passes through
    /// unchanged so nested wrapping never stacks task names.
    #[must_use]
    pub fn node_failure(task: &str, source: Self) -> Self {
        match source {
            err @ Self::NodeEvaluation { .. } => err,
            other => Self::NodeEvaluation {
                task: task.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Creates a cache unavailability error for the given path.
    #[must_use]
    pub fn cache_unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CacheUnavailable {
            path: path.into(),
            source,
        }
    }
}
