//! # Dagflow
//!
//! Utilities for constructing and running memoized task-graph pipelines.
//!
//! Dagflow lets a caller describe a computation as a set of interdependent
//! tasks, memoize each task's result by its inputs, and execute the
//! resulting DAG under three concurrency modes:
//!
//! - **Blocking**: evaluate on the calling task and return the value.
//! - **Background**: evaluate behind a handle, one evaluation per pipeline
//!   instance at a time.
//! - **Distributed**: provision a worker pool and dispatch node evaluations
//!   to it; topology and caching semantics are unchanged.
//!
//! ## Quick Start
//!
//! ```rust
//! use dagflow::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Doubler {
//!     identity: PipelineIdentity,
//! }
//!
//! impl Pipeline for Doubler {
//!     fn id(&self) -> uuid::Uuid {
//!         self.identity.id()
//!     }
//!
//!     fn name(&self) -> &str {
//!         self.identity.name()
//!     }
//!
//!     fn build(&self) -> dagflow::Result<TaskGraph> {
//!         let mut builder = GraphBuilder::new();
//!         let doubled = builder
//!             .task("double", |args: CallArgs| {
//!                 let n = args.get(0).and_then(TaskValue::as_i64).unwrap_or(0);
//!                 Ok(json!(n * 2))
//!             })
//!             .arg(json!(21))
//!             .finish();
//!         Ok(builder.build(doubled))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dagflow::Result<()> {
//! let cache_dir = tempfile::tempdir().map_err(dagflow::DagflowError::Io)?;
//! let runner = Runner::new(Arc::new(Cache::new(cache_dir.path())));
//! let pipeline = Doubler {
//!     identity: PipelineIdentity::new("doubler"),
//! };
//!
//! let value = runner
//!     .run(&pipeline, RunOptions::new())
//!     .await?
//!     .resolve()
//!     .await?;
//! assert_eq!(value, json!(42));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cluster;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod hooks;
pub mod observability;
pub mod pipeline;
pub mod relay;


pub use errors::{DagflowError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{Cache, Fingerprint};
    pub use crate::cluster::{
        ClusterBackend, ClusterConfig, ClusterOverrides, LocalBackend, WorkerClient,
    };
    pub use crate::engine::{Engine, EvalMode};
    pub use crate::errors::{DagflowError, Result};
    pub use crate::graph::{
        CallArgs, GraphBuilder, SinkPolicy, TaskGraph, TaskHandle, TaskOptions, TaskValue,
    };
    pub use crate::hooks::{CallbackScope, HookRegistry, ListenerGuard};
    pub use crate::pipeline::{
        EvalHandle, Pipeline, PipelineIdentity, RunOptions, RunOutcome, Runner,
    };
    pub use crate::relay::{LogLevel, LogRecord, RelayConsumer, RelaySender};
}
