//! Cluster provisioning: resource configuration and the worker-pool seam.
//!
//! Dagflow does not implement a distributed runtime of its own. Provisioning
//! translates a [`ClusterConfig`] into a live pool through a
//! [`ClusterBackend`], and the execution engine dispatches node evaluations
//! through the resulting [`WorkerClient`]. The crate ships [`LocalBackend`],
//! an in-process pool, as the reference implementation; real schedulers
//! implement the backend trait externally.

use crate::errors::{DagflowError, Result};
use crate::graph::{CallArgs, TaskFn, TaskValue};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Resource configuration for a provisioned cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Scheduler queue to submit workers to.
    pub queue: String,
    /// Memory request per worker.
    pub memory: String,
    /// Core count per worker.
    pub cores: u32,
    /// Walltime limit per worker.
    pub walltime: String,
    /// Scratch directory local to each worker.
    pub local_directory: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            queue: "RAM.q".to_string(),
            memory: "8G".to_string(),
            cores: 2,
            walltime: "12:00:00".to_string(),
            local_directory: default_scratch_dir(),
        }
    }
}

impl ClusterConfig {
    /// Applies caller overrides over the defaults, field by field.
    ///
    /// Fields absent from the overrides keep their default value; fields
    /// present always win, never the other way around.
    #[must_use]
    pub fn merged(overrides: Option<&ClusterOverrides>) -> Self {
        let mut config = Self::default();
        if let Some(overrides) = overrides {
            if let Some(queue) = &overrides.queue {
                config.queue = queue.clone();
            }
            if let Some(memory) = &overrides.memory {
                config.memory = memory.clone();
            }
            if let Some(cores) = overrides.cores {
                config.cores = cores;
            }
            if let Some(walltime) = &overrides.walltime {
                config.walltime = walltime.clone();
            }
            if let Some(local_directory) = &overrides.local_directory {
                config.local_directory = local_directory.clone();
            }
        }
        config
    }
}

/// Caller-supplied partial cluster configuration.
///
/// Deserializes from a plain mapping, so overrides can come straight from a
/// JSON configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterOverrides {
    /// Scheduler queue override.
    pub queue: Option<String>,
    /// Memory request override.
    pub memory: Option<String>,
    /// Core count override.
    pub cores: Option<u32>,
    /// Walltime override.
    pub walltime: Option<String>,
    /// Scratch directory override.
    pub local_directory: Option<PathBuf>,
}

/// Per-user scratch directory under the system temp root.
fn default_scratch_dir() -> PathBuf {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "dagflow".to_string());
    std::env::temp_dir().join(format!("dagflow-{user}"))
}

/// A fully resolved provisioning request.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    /// Effective resource configuration.
    pub config: ClusterConfig,
    /// Number of workers to scale the pool to.
    pub workers: usize,
}

/// One task invocation handed to a remote worker.
pub struct TaskInvocation {
    /// The task's qualified name.
    pub task: String,
    /// The callable to invoke.
    pub func: TaskFn,
    /// Resolved call arguments.
    pub args: CallArgs,
}

impl fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("task", &self.task)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Client handle the execution engine uses to dispatch node evaluations to
/// a provisioned pool.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Submits one invocation and waits for its result.
    async fn submit(&self, invocation: TaskInvocation) -> Result<TaskValue>;
}

/// Backend that turns a provisioning request into a live worker pool.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Provisions a pool for the given spec.
    ///
    /// # Errors
    ///
    /// A backend that cannot satisfy the request fails with
    /// [`DagflowError::Provisioning`]; the error propagates to the `run()`
    /// caller with no retry and no local fallback.
    async fn provision(&self, spec: &ClusterSpec) -> Result<ProvisionedCluster>;
}

/// A live cluster: the pool handle plus the client bound to it.
pub struct ProvisionedCluster {
    /// Handle owning the pool's lifetime.
    pub handle: ClusterHandle,
    /// Client used by the execution engine for dispatch.
    pub client: Arc<dyn WorkerClient>,
}

/// Owns a provisioned pool. Workers shut down when both the handle and
/// every client bound to it are dropped.
pub struct ClusterHandle {
    spec: ClusterSpec,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl ClusterHandle {
    /// Creates a handle over already-spawned workers.
    #[must_use]
    pub fn new(spec: ClusterSpec, workers: Vec<tokio::task::JoinHandle<()>>) -> Self {
        Self { spec, workers }
    }

    /// The spec this pool was provisioned from.
    #[must_use]
    pub const fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("spec", &self.spec)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Provisions a cluster through the given backend.
///
/// # Errors
///
/// Propagates the backend's provisioning failure unchanged.
pub async fn provision(
    backend: &dyn ClusterBackend,
    config: ClusterConfig,
    workers: usize,
) -> Result<ProvisionedCluster> {
    let spec = ClusterSpec { config, workers };
    backend.provision(&spec).await
}

type Job = (TaskInvocation, oneshot::Sender<Result<TaskValue>>);

/// In-process reference backend: a pool of tokio workers draining a shared
/// queue. Placement-only; caching and graph semantics are identical to
/// local execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

#[async_trait]
impl ClusterBackend for LocalBackend {
    async fn provision(&self, spec: &ClusterSpec) -> Result<ProvisionedCluster> {
        if spec.workers == 0 {
            return Err(DagflowError::Provisioning(
                "worker count must be at least 1".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel::<Job>(spec.workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..spec.workers)
            .map(|index| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some((invocation, reply)) = job else {
                            break;
                        };
                        tracing::debug!(worker = index, task = %invocation.task, "worker picked up task");
                        let result = (invocation.func)(invocation.args);
                        // A dropped receiver means the evaluation was abandoned.
                        let _ = reply.send(result);
                    }
                })
            })
            .collect();

        Ok(ProvisionedCluster {
            handle: ClusterHandle::new(spec.clone(), workers),
            client: Arc::new(LocalClient { tx }),
        })
    }
}

struct LocalClient {
    tx: mpsc::Sender<Job>,
}

#[async_trait]
impl WorkerClient for LocalClient {
    async fn submit(&self, invocation: TaskInvocation) -> Result<TaskValue> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((invocation, reply_tx))
            .await
            .map_err(|_| DagflowError::Join("worker pool shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| DagflowError::Join("worker dropped before replying".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.queue, "RAM.q");
        assert_eq!(config.memory, "8G");
        assert_eq!(config.cores, 2);
        assert_eq!(config.walltime, "12:00:00");
    }

    #[test]
    fn test_merge_without_overrides_keeps_defaults() {
        assert_eq!(ClusterConfig::merged(None), ClusterConfig::default());
        assert_eq!(
            ClusterConfig::merged(Some(&ClusterOverrides::default())),
            ClusterConfig::default()
        );
    }

    #[test]
    fn test_merge_partial_override() {
        let overrides = ClusterOverrides {
            cores: Some(4),
            ..Default::default()
        };
        let merged = ClusterConfig::merged(Some(&overrides));

        let expected = ClusterConfig {
            cores: 4,
            ..Default::default()
        };
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_overrides_deserialize_from_mapping() {
        let overrides: ClusterOverrides =
            serde_json::from_value(json!({"cores": 4, "memory": "16G"})).unwrap();
        assert_eq!(overrides.cores, Some(4));
        assert_eq!(overrides.memory, Some("16G".to_string()));
        assert_eq!(overrides.queue, None);
    }

    #[tokio::test]
    async fn test_local_backend_runs_submitted_tasks() {
        let provisioned = LocalBackend
            .provision(&ClusterSpec {
                config: ClusterConfig::default(),
                workers: 2,
            })
            .await
            .unwrap();

        assert_eq!(provisioned.handle.worker_count(), 2);

        let invocation = TaskInvocation {
            task: "double".to_string(),
            func: Arc::new(|args: CallArgs| {
                let n = args.get(0).and_then(TaskValue::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            }),
            args: CallArgs {
                positional: vec![json!(21)],
                keyword: std::collections::BTreeMap::new(),
            },
        };

        let value = provisioned.client.submit(invocation).await.unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn test_local_backend_rejects_empty_pool() {
        let result = LocalBackend
            .provision(&ClusterSpec {
                config: ClusterConfig::default(),
                workers: 0,
            })
            .await;
        assert!(matches!(result, Err(DagflowError::Provisioning(_))));
    }
}
