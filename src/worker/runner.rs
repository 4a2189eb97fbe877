use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::error::{Result, WorkerError};
use crate::worker::job::Job;

/// Configuration for limiting jobs.
#[derive(Debug, Clone, Default)]
pub struct JobLimitConfig {
    /// Resource limits per job.
    pub resource_limits: JobResourceLimits,
    /// Namespace isolation per job.
    pub isolation: JobIsolation,
}

/// Per-job resource limits. Also the wire form handed to the child-exec
/// helper, so the serde names are stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResourceLimits {
    /// Maximum amount of CPU microseconds to divvy up.
    #[serde(rename = "cpu_max_period", default, skip_serializing_if = "is_zero")]
    pub cpu_max_period: u64,
    /// Maximum amount of CPU microseconds, per period, that can be used.
    #[serde(rename = "cpu_max_quota", default, skip_serializing_if = "is_zero")]
    pub cpu_max_quota: u64,
    /// Maximum amount of bytes, including swap, that can be allocated.
    #[serde(rename = "memory_max", default, skip_serializing_if = "is_zero")]
    pub memory_max: u64,
    /// Maximum read and write bytes per second per device. The key is
    /// "major:minor" of the device, or empty string to default to the device
    /// this worker executable is running on.
    #[serde(
        rename = "device_io_max",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub device_io_max: HashMap<String, u64>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Kernel namespaces to isolate per job. UTS, IPC, and user namespaces are
/// always applied by the limited runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobIsolation {
    pub pid: bool,
    pub network: bool,
    pub mount: bool,
}

/// Arguments serialized into the child-exec helper's first positional
/// parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct JobLimitArgs {
    #[serde(flatten)]
    pub resource_limits: JobResourceLimits,
    #[serde(rename = "root-mount", default, skip_serializing_if = "Option::is_none")]
    pub root_mount: Option<String>,
}

pub(crate) enum Runner {
    Plain(PlainRunner),
    #[cfg(target_os = "linux")]
    Limited(super::limited::LimitedRunner),
}

impl Runner {
    /// Starts the job's child process. Guaranteed to have recorded the pid on
    /// success; the job is not shared with other tasks until this returns.
    pub(crate) async fn start(&self, job: &Arc<Job>) -> Result<()> {
        match self {
            Runner::Plain(runner) => runner.start(job).await,
            #[cfg(target_os = "linux")]
            Runner::Limited(runner) => runner.start(job).await,
        }
    }
}

/// Runs the user command directly with no isolation.
pub(crate) struct PlainRunner;

impl PlainRunner {
    pub(crate) async fn start(&self, job: &Arc<Job>) -> Result<()> {
        // Cannot have a job root when running direct
        if job.root_fs().is_some() {
            return Err(WorkerError::RootFsNotSupported);
        }
        let mut cmd = Command::new(job.command());
        cmd.args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Start(io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Start(io::Error::other("missing stderr pipe")))?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::Start(io::Error::other("child exited before start returned")))?
            as i32;
        supervise(
            job.clone(),
            ChildProc {
                pid,
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
                waiter: ChildWaiter::Spawned(child),
            },
        );
        Ok(())
    }
}

/// A started child process handed to [`supervise`].
pub(crate) struct ChildProc {
    pub(crate) pid: i32,
    pub(crate) stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) waiter: ChildWaiter,
}

pub(crate) enum ChildWaiter {
    /// A child spawned through tokio's process API.
    Spawned(Child),
    /// A child created with clone(2); reaped with a blocking waitpid.
    #[cfg(target_os = "linux")]
    Cloned(Pid),
}

impl ChildWaiter {
    /// Waits for the child and decodes its exit code, -1 when the process was
    /// killed by a signal or the status could not be determined.
    async fn wait(self, job: &Job) -> i32 {
        match self {
            ChildWaiter::Spawned(mut child) => match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    tracing::warn!(
                        namespace = %job.namespace(),
                        id = %job.id(),
                        error = %err,
                        "Child execution failed without exit code"
                    );
                    -1
                }
            },
            #[cfg(target_os = "linux")]
            ChildWaiter::Cloned(pid) => {
                let waited = tokio::task::spawn_blocking(move || waitpid(pid, None)).await;
                match waited {
                    Ok(Ok(WaitStatus::Exited(_, code))) => code,
                    Ok(Ok(_)) => -1,
                    Ok(Err(err)) => {
                        tracing::warn!(
                            namespace = %job.namespace(),
                            id = %job.id(),
                            error = %err,
                            "Child execution failed without exit code"
                        );
                        -1
                    }
                    Err(err) => {
                        tracing::warn!(
                            namespace = %job.namespace(),
                            id = %job.id(),
                            error = %err,
                            "Reaper task failed"
                        );
                        -1
                    }
                }
            }
        }
    }
}

/// Records the pid and spawns the supervision tasks for a started child: one
/// output pump per stream, a reaper, and a stop signaler.
pub(crate) fn supervise(job: Arc<Job>, child: ChildProc) {
    job.set_pid(child.pid);
    let stdout_done = tokio::spawn(pump(job.clone(), false, child.stdout));
    let stderr_done = tokio::spawn(pump(job.clone(), true, child.stderr));
    let waiter = child.waiter;
    let pid = child.pid;
    let reaper_job = job.clone();
    tokio::spawn(async move {
        // Wait for the pipes to drain before waiting on the process itself;
        // waiting first can lose output still in flight.
        let _ = stdout_done.await;
        let _ = stderr_done.await;
        let exit_code = waiter.wait(&reaper_job).await;
        reaper_job.mark_done(exit_code).await;
    });
    tokio::spawn(signal_on_stop(job, pid));
}

/// Reads a stream in fixed-size chunks into the job until EOF. Other read
/// errors are logged and end the stream without affecting job state.
async fn pump(job: Arc<Job>, stderr: bool, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => job.append_output(stderr, &buf[..n]).await,
            Err(err) => {
                tracing::warn!(
                    namespace = %job.namespace(),
                    id = %job.id(),
                    error = %err,
                    "Got non-EOF error on job output"
                );
                return;
            }
        }
    }
}

/// Delivers SIGTERM on a soft stop and SIGKILL on a forced stop, then exits
/// once the job is done. A forced stop after a soft one still escalates.
/// Signal errors are ignored; the process may already have exited.
async fn signal_on_stop(job: Arc<Job>, pid: i32) {
    let pid = Pid::from_raw(pid);
    tokio::select! {
        _ = job.done_token().cancelled() => return,
        _ = job.force_stop_token().cancelled() => {
            let _ = kill(pid, Signal::SIGKILL);
            return;
        }
        _ = job.stop_token().cancelled() => {
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
    tokio::select! {
        _ = job.done_token().cancelled() => {}
        _ = job.force_stop_token().cancelled() => {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
}

pub(crate) fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_plain_runner_rejects_root_fs() {
        let job = Arc::new(Job::new(
            "",
            "id",
            "true",
            Vec::new(),
            Some("/tmp".to_string()),
        ));
        let err = PlainRunner.start(&job).await.unwrap_err();
        assert!(matches!(err, WorkerError::RootFsNotSupported));
        assert!(job.pid().is_none());
    }

    #[tokio::test]
    async fn test_plain_runner_captures_output_and_exit() {
        let job = Arc::new(Job::new(
            "",
            "id",
            "sh",
            vec![
                "-c".to_string(),
                "printf out1; printf err1 1>&2; exit 3".to_string(),
            ],
            None,
        ));
        PlainRunner.start(&job).await.unwrap();
        assert!(job.pid().is_some());

        tokio::time::timeout(Duration::from_secs(5), job.done_token().cancelled())
            .await
            .unwrap();
        assert_eq!(job.exit_code().await, Some(3));

        let mut buf = [0u8; 64];
        let (read, _, _) = job.read_stdout(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..read], b"out1");
        let (read, _, _) = job.read_stderr(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..read], b"err1");
    }

    #[tokio::test]
    async fn test_plain_runner_spawn_failure() {
        let job = Arc::new(Job::new(
            "",
            "id",
            "/definitely/not/a/command",
            Vec::new(),
            None,
        ));
        let err = PlainRunner.start(&job).await.unwrap_err();
        assert!(matches!(err, WorkerError::Start(_)));
    }

    #[tokio::test]
    async fn test_signaled_child_reports_negative_one() {
        let job = Arc::new(Job::new(
            "",
            "id",
            "sleep",
            vec!["30".to_string()],
            None,
        ));
        PlainRunner.start(&job).await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), job.stop(true))
            .await
            .unwrap();
        assert_eq!(code, -1);
    }

    #[test]
    fn test_limit_args_json_schema() {
        let args = JobLimitArgs {
            resource_limits: JobResourceLimits {
                cpu_max_period: 10000,
                cpu_max_quota: 2000,
                memory_max: 0,
                device_io_max: HashMap::new(),
            },
            root_mount: None,
        };
        let json = serde_json::to_string(&args).unwrap();
        // Zero and empty fields are omitted
        assert_eq!(json, r#"{"cpu_max_period":10000,"cpu_max_quota":2000}"#);

        // Unknown fields are ignored and absent fields default
        let parsed: JobLimitArgs =
            serde_json::from_str(r#"{"memory_max":5,"root-mount":"/r","future":true}"#).unwrap();
        assert_eq!(parsed.resource_limits.memory_max, 5);
        assert_eq!(parsed.resource_limits.cpu_max_period, 0);
        assert_eq!(parsed.root_mount.as_deref(), Some("/r"));
    }
}
