//! The pipeline contract and the run surface.
//!
//! Callers implement [`Pipeline::build`] to describe a computation as a task
//! graph, then hand the pipeline to a [`Runner`]. The runner owns the shared
//! cache, the hook registry and the cluster backend, and executes builds
//! under the mode selected by [`RunOptions`]: blocking on the calling task,
//! in the background behind an [`EvalHandle`], or distributed across a
//! provisioned worker pool.

use crate::cache::Cache;
use crate::cluster::{self, ClusterBackend, ClusterConfig, ClusterOverrides, LocalBackend, ProvisionedCluster};
use crate::engine::{Engine, EvalMode};
use crate::errors::{DagflowError, Result};
use crate::graph::{render_png, TaskGraph, TaskValue};
use crate::hooks::HookRegistry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// A computation described as a buildable task graph.
///
/// `build()` is invoked exactly once per run and must return a fresh graph;
/// re-running a pipeline rebuilds from scratch, never reusing a prior graph.
pub trait Pipeline: Send + Sync {
    /// Unique identity of this pipeline instance. Used to serialize
    /// background evaluations of the same instance.
    fn id(&self) -> Uuid;

    /// Human-readable pipeline name.
    fn name(&self) -> &str {
        "pipeline"
    }

    /// Assembles the task graph for one run.
    ///
    /// # Errors
    ///
    /// The default body fails with [`DagflowError::BuildNotImplemented`];
    /// concrete pipelines must override it.
    fn build(&self) -> Result<TaskGraph> {
        Err(DagflowError::BuildNotImplemented {
            pipeline: self.name().to_string(),
        })
    }

    /// Whether the cache is cleared after a successful run (default: true).
    fn clear_cache_on_completion(&self) -> bool {
        true
    }

    /// Cluster configuration carried by the pipeline itself. Overridden by
    /// any configuration supplied through [`RunOptions`].
    fn cluster_config(&self) -> Option<ClusterOverrides> {
        None
    }

    /// Renders this pipeline's graph to a PNG image.
    ///
    /// # Errors
    ///
    /// Fails with [`DagflowError::RenderingUnavailable`] when the Graphviz
    /// toolchain is missing; independent of `run()`.
    fn visualize(&self, output: &Path) -> Result<()> {
        render_png(&self.build()?, output)
    }
}

/// Identity helper for concrete pipelines: a fresh UUID plus a name.
#[derive(Debug, Clone)]
pub struct PipelineIdentity {
    id: Uuid,
    name: String,
}

impl PipelineIdentity {
    /// Creates a new identity with a random id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// The unique id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Options for a single `run()` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Evaluate on the calling task and return the value directly
    /// (default: true). When false, evaluation happens in the background
    /// and `run()` returns an [`EvalHandle`] immediately.
    pub block: bool,
    /// Provision a cluster and dispatch node evaluations to it
    /// (default: false).
    pub cluster: bool,
    /// Cluster configuration overrides for this run. Takes precedence over
    /// [`Pipeline::cluster_config`].
    pub cluster_config: Option<ClusterOverrides>,
    /// Workers to provision when `cluster` is set (default: 8).
    pub workers: usize,
    /// Force strictly sequential local evaluation regardless of the other
    /// options, for deterministic reproduction of failures (default: false).
    pub debug: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            block: true,
            cluster: false,
            cluster_config: None,
            workers: 8,
            debug: false,
        }
    }
}

impl RunOptions {
    /// Creates the default options: blocking, local, eight workers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs in the background, returning an evaluation handle.
    #[must_use]
    pub const fn background(mut self) -> Self {
        self.block = false;
        self
    }

    /// Dispatches node evaluations to a provisioned cluster.
    #[must_use]
    pub const fn on_cluster(mut self) -> Self {
        self.cluster = true;
        self
    }

    /// Supplies cluster configuration overrides for this run.
    #[must_use]
    pub fn with_cluster_config(mut self, overrides: ClusterOverrides) -> Self {
        self.cluster_config = Some(overrides);
        self
    }

    /// Sets the worker count for cluster runs.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Forces sequential local evaluation.
    #[must_use]
    pub const fn debug(mut self) -> Self {
        self.debug = true;
        self
    }
}

/// Handle to a background graph evaluation.
///
/// Dropping the handle abandons observation only: the submitted evaluation
/// keeps running to completion or failure. There is no cancellation path.
#[derive(Debug)]
pub struct EvalHandle {
    inner: tokio::task::JoinHandle<Result<TaskValue>>,
}

impl EvalHandle {
    /// Waits for the evaluation and returns its result. Evaluation-time
    /// failures surface here rather than on the background task.
    ///
    /// # Errors
    ///
    /// Returns the evaluation's error, or [`DagflowError::Join`] when the
    /// background task itself was lost.
    pub async fn join(self) -> Result<TaskValue> {
        self.inner
            .await
            .map_err(|err| DagflowError::Join(err.to_string()))?
    }

    /// Whether the evaluation has finished (successfully or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

/// Outcome of a `run()` call.
#[derive(Debug)]
pub enum RunOutcome {
    /// A blocking run finished with this value.
    Completed(TaskValue),
    /// A background run is in flight.
    Running(EvalHandle),
}

impl RunOutcome {
    /// The completed value, if this was a blocking run.
    #[must_use]
    pub fn completed(self) -> Option<TaskValue> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Running(_) => None,
        }
    }

    /// Resolves to the final value either way, awaiting a background run.
    ///
    /// # Errors
    ///
    /// Propagates the evaluation's failure.
    pub async fn resolve(self) -> Result<TaskValue> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Running(handle) => handle.join().await,
        }
    }
}

/// Executes pipelines: builds their graphs and evaluates them under the
/// requested mode against shared cache, hooks and cluster backend.
pub struct Runner {
    cache: Arc<Cache>,
    hooks: HookRegistry,
    backend: Arc<dyn ClusterBackend>,
    /// One evaluation slot per pipeline instance; background runs of the
    /// same instance are serialized, bounding resource use.
    slots: DashMap<Uuid, Arc<Semaphore>>,
}

impl Runner {
    /// Creates a runner over the given cache, using the in-process cluster
    /// backend.
    #[must_use]
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            hooks: HookRegistry::new(),
            backend: Arc::new(LocalBackend),
            slots: DashMap::new(),
        }
    }

    /// Replaces the cluster backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn ClusterBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// The shared cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The hook registry for lifecycle listeners.
    #[must_use]
    pub const fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Runs a pipeline.
    ///
    /// Builds a fresh graph, optionally provisions a cluster, evaluates,
    /// then notifies hooks and clears the cache on success (when the
    /// pipeline asks for it).
    ///
    /// # Errors
    ///
    /// Build and provisioning failures surface synchronously; evaluation
    /// failures surface here for blocking runs and through the returned
    /// [`EvalHandle`] for background runs.
    pub async fn run(&self, pipeline: &dyn Pipeline, options: RunOptions) -> Result<RunOutcome> {
        let graph = pipeline.build()?;

        // Debug means local and sequential, overriding cluster dispatch.
        let provisioned = if options.cluster && !options.debug {
            let overrides = options
                .cluster_config
                .clone()
                .or_else(|| pipeline.cluster_config());
            let config = ClusterConfig::merged(overrides.as_ref());
            tracing::info!(
                pipeline = pipeline.name(),
                workers = options.workers,
                queue = %config.queue,
                "provisioning cluster"
            );
            Some(cluster::provision(self.backend.as_ref(), config, options.workers).await?)
        } else {
            None
        };

        let engine = match &provisioned {
            Some(cluster) => Engine::new(Arc::clone(&self.cache)).with_client(Arc::clone(&cluster.client)),
            None => Engine::new(Arc::clone(&self.cache)),
        };

        if options.block {
            let value = self
                .evaluate_and_finish(pipeline.name(), &engine, &graph, EvalMode::Sequential, pipeline.clear_cache_on_completion())
                .await?;
            drop(provisioned);
            Ok(RunOutcome::Completed(value))
        } else {
            Ok(RunOutcome::Running(self.spawn_background(
                pipeline,
                engine,
                graph,
                provisioned,
                options.debug,
            )))
        }
    }

    fn spawn_background(
        &self,
        pipeline: &dyn Pipeline,
        engine: Engine,
        graph: TaskGraph,
        provisioned: Option<ProvisionedCluster>,
        debug: bool,
    ) -> EvalHandle {
        let slot = self
            .slots
            .entry(pipeline.id())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        let name = pipeline.name().to_string();
        let clear = pipeline.clear_cache_on_completion();
        let cache = Arc::clone(&self.cache);
        let hooks = self.hooks.clone();
        let mode = if debug {
            EvalMode::Sequential
        } else {
            EvalMode::Concurrent
        };

        let inner = tokio::spawn(async move {
            let _permit = slot
                .acquire_owned()
                .await
                .map_err(|err| DagflowError::Internal(err.to_string()))?;
            // Keeps the provisioned pool alive for the whole evaluation.
            let _cluster = provisioned;

            let _scope = hooks.scope(&name);
            let value = engine.evaluate(&graph, mode).await?;

            // Completion actions run on the task that observed completion,
            // and only after success.
            hooks.notify(&value);
            if clear {
                cache.clear(false);
            }
            Ok(value)
        });

        EvalHandle { inner }
    }

    async fn evaluate_and_finish(
        &self,
        name: &str,
        engine: &Engine,
        graph: &TaskGraph,
        mode: EvalMode,
        clear: bool,
    ) -> Result<TaskValue> {
        let _scope = self.hooks.scope(name);
        let value = engine.evaluate(graph, mode).await?;

        self.hooks.notify(&value);
        if clear {
            self.cache.clear(false);
        }
        Ok(value)
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("cache_root", &self.cache.root())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
