//! In-process job supervisor: the worker owns jobs by `(namespace, id)` and
//! starts them through a plain or limited runner.

pub mod job;
mod runner;

#[cfg(target_os = "linux")]
pub mod child_exec;
#[cfg(target_os = "linux")]
mod isolation;
#[cfg(target_os = "linux")]
mod limited;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
#[cfg(target_os = "linux")]
pub use isolation::IsolationError;
pub use job::{Job, JobUpdate};
pub use runner::{JobIsolation, JobLimitConfig, JobResourceLimits};
use runner::{PlainRunner, Runner};

/// Reserved first CLI argument that routes a process into the child-exec
/// entrypoint instead of normal command dispatch.
pub const CHILD_EXEC_ARG: &str = "child-exec";

/// Configuration for a worker.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// If `None`, jobs will not have any limits placed.
    pub limits: Option<JobLimitConfig>,
}

impl Config {
    /// A commonly used configuration for limiting jobs: 0.2 cores, 50MB of
    /// memory, 1MB/s of IO on the worker executable's device, and PID,
    /// network, and mount namespace isolation.
    pub fn standard() -> Self {
        Self {
            limits: Some(JobLimitConfig {
                resource_limits: JobResourceLimits {
                    cpu_max_period: 10000,
                    cpu_max_quota: 2000,
                    memory_max: 50 * 1024 * 1024,
                    device_io_max: HashMap::from([(String::new(), 1024 * 1024)]),
                },
                isolation: JobIsolation {
                    pid: true,
                    network: true,
                    mount: true,
                },
            }),
        }
    }
}

/// A worker that manages jobs. All methods reject with
/// [`WorkerError::Shutdown`] once [`Worker::shutdown`] has been called.
pub struct Worker {
    runner: Runner,
    has_limits: bool,
    // Keyed by namespace, then id; `None` reserves an id while its runner
    // starts
    jobs: RwLock<HashMap<String, HashMap<String, Option<Arc<Job>>>>>,
    shutdown: RwLock<bool>,
}

impl Worker {
    /// Creates a new worker from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        let has_limits = config.limits.is_some();
        let runner = match config.limits {
            #[cfg(target_os = "linux")]
            Some(limits) => Runner::Limited(limited::LimitedRunner::new(limits)?),
            #[cfg(not(target_os = "linux"))]
            Some(_) => return Err(WorkerError::LimitsUnsupported),
            None => Runner::Plain(PlainRunner),
        };
        Ok(Self {
            runner,
            has_limits,
            jobs: RwLock::default(),
            shutdown: RwLock::new(false),
        })
    }

    /// Returns the job for the given namespace and id, or `None` if there is
    /// no such job. Callers outside the namespace cannot distinguish a
    /// missing job from one they are not allowed to see.
    pub async fn get_job(&self, namespace: &str, id: &str) -> Result<Option<Arc<Job>>> {
        let shutdown = self.shutdown.read().await;
        if *shutdown {
            return Err(WorkerError::Shutdown);
        }
        let jobs = self.jobs.read().await;
        Ok(jobs
            .get(namespace)
            .and_then(|by_id| by_id.get(id))
            .and_then(|job| job.clone()))
    }

    /// Submits a job to run on the worker. If `id` is empty a UUIDv4 is
    /// generated, otherwise it must be unique within the namespace or
    /// [`WorkerError::IdAlreadyExists`] is returned. `root_fs` can only be
    /// set on a worker configured with limits. On success the returned job
    /// has its pid recorded.
    pub async fn submit_job(
        &self,
        namespace: &str,
        id: &str,
        command: &str,
        args: Vec<String>,
        root_fs: Option<String>,
    ) -> Result<Arc<Job>> {
        // Hold the shutdown guard for the life of the submission so a
        // shutdowner never observes a half-registered job
        let shutdown = self.shutdown.read().await;
        if *shutdown {
            return Err(WorkerError::Shutdown);
        }
        let id = if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        {
            let mut jobs = self.jobs.write().await;
            let by_id = jobs.entry(namespace.to_string()).or_default();
            if by_id.contains_key(&id) {
                return Err(WorkerError::IdAlreadyExists);
            }
            // Reserve the id before starting the runner so concurrent
            // submissions cannot claim it
            by_id.insert(id.clone(), None);
        }
        match self.start_job(namespace, &id, command, args, root_fs).await {
            Ok(job) => {
                let mut jobs = self.jobs.write().await;
                if let Some(by_id) = jobs.get_mut(namespace) {
                    by_id.insert(id, Some(job.clone()));
                }
                Ok(job)
            }
            Err(err) => {
                let mut jobs = self.jobs.write().await;
                if let Some(by_id) = jobs.get_mut(namespace) {
                    by_id.remove(&id);
                }
                Err(err)
            }
        }
    }

    async fn start_job(
        &self,
        namespace: &str,
        id: &str,
        command: &str,
        args: Vec<String>,
        root_fs: Option<String>,
    ) -> Result<Arc<Job>> {
        if !self.has_limits && root_fs.is_some() {
            return Err(WorkerError::RootFsWithoutLimits);
        }
        let job = Arc::new(Job::new(namespace, id, command, args, root_fs));
        self.runner.start(&job).await?;
        Ok(job)
    }

    /// Stops all jobs and waits for every one of them to finish. Once called,
    /// no other calls can be used on this worker; a second call returns
    /// [`WorkerError::Shutdown`]. Callers that need a bound on the drain
    /// should wrap this in a timeout.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        {
            let mut shutdown = self.shutdown.write().await;
            if *shutdown {
                return Err(WorkerError::Shutdown);
            }
            *shutdown = true;
        }
        // Detach the registry; the jobs are drained from here on
        let jobs = std::mem::take(&mut *self.jobs.write().await);
        let mut stops = JoinSet::new();
        for by_id in jobs.into_values() {
            for job in by_id.into_values().flatten() {
                stops.spawn(async move {
                    job.stop(force).await;
                });
            }
        }
        while stops.join_next().await.is_some() {}
        Ok(())
    }
}
