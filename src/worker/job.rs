use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};

/// The kind of change an update listener is being woken for. Updates carry no
/// data; listeners re-read job state on every wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobUpdate {
    StdoutAppended,
    StderrAppended,
    Completed,
}

/// A running or completed job. Identity fields never change after creation;
/// output and exit state are only readable through the accessors below.
#[derive(Debug)]
pub struct Job {
    namespace: String,
    id: String,
    command: String,
    args: Vec<String>,
    root_fs: Option<String>,
    created_at: DateTime<Utc>,
    pid: OnceLock<i32>,

    done: CancellationToken,
    stop: CancellationToken,
    force_stop: CancellationToken,

    state: RwLock<JobState>,
}

#[derive(Default, Debug)]
struct JobState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    listeners: HashMap<u64, mpsc::Sender<JobUpdate>>,
    next_listener: u64,
}

impl JobState {
    /// Non-blocking fan-out: a full listener misses this wake, a closed
    /// listener is dropped from the set.
    fn notify(&mut self, update: JobUpdate) {
        self.listeners
            .retain(|_, tx| !matches!(tx.try_send(update), Err(TrySendError::Closed(_))));
    }
}

impl Job {
    pub(crate) fn new(
        namespace: &str,
        id: &str,
        command: &str,
        args: Vec<String>,
        root_fs: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            command: command.to_string(),
            args,
            root_fs,
            created_at: Utc::now(),
            pid: OnceLock::new(),
            done: CancellationToken::new(),
            stop: CancellationToken::new(),
            force_stop: CancellationToken::new(),
            state: RwLock::default(),
        }
    }

    /// Namespace of the job, may be empty.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Id of the job, never empty.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Root directory the job is limited to, if any.
    pub fn root_fs(&self) -> Option<&str> {
        self.root_fs.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Host pid of the job's child process. Set exactly once when the runner
    /// starts the process.
    pub fn pid(&self) -> Option<i32> {
        self.pid.get().copied()
    }

    pub(crate) fn set_pid(&self, pid: i32) {
        let _ = self.pid.set(pid);
    }

    /// Non-blocking read of job output into `buf` from the given offset,
    /// stderr instead of stdout if `stderr` is set. Returns the amount read,
    /// the total captured length, and the exit code if the job has completed.
    ///
    /// `buf` may be empty to query only the total and exit code. A non-empty
    /// read past the end of the output is an error.
    pub async fn read_output(
        &self,
        stderr: bool,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(usize, usize, Option<i32>)> {
        let state = self.state.read().await;
        let out = if stderr { &state.stderr } else { &state.stdout };
        let total = out.len();
        let mut read = 0;
        if !buf.is_empty() {
            if offset > total {
                return Err(WorkerError::OffsetOutOfBounds { offset, total });
            }
            read = buf.len().min(total - offset);
            buf[..read].copy_from_slice(&out[offset..offset + read]);
        }
        Ok((read, total, state.exit_code))
    }

    /// [`Job::read_output`] for stdout.
    pub async fn read_stdout(
        &self,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(usize, usize, Option<i32>)> {
        self.read_output(false, buf, offset).await
    }

    /// [`Job::read_output`] for stderr.
    pub async fn read_stderr(
        &self,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(usize, usize, Option<i32>)> {
        self.read_output(true, buf, offset).await
    }

    /// Register a channel to receive an update kind on each change. Sends are
    /// non-blocking: a full channel misses the notification, so callers
    /// should size the buffer for every update kind they care about (>= 3
    /// covers one pending wake of each kind) and re-read state on every wake.
    ///
    /// Returns a token for [`Job::remove_update_listener`].
    pub async fn add_update_listener(&self, updates: mpsc::Sender<JobUpdate>) -> u64 {
        let mut state = self.state.write().await;
        let token = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(token, updates);
        token
    }

    /// Deregister a previously added listener. Unknown tokens are ignored.
    pub async fn remove_update_listener(&self, token: u64) {
        self.state.write().await.listeners.remove(&token);
    }

    /// Stop the job if not already stopped and wait for completion, returning
    /// the final exit code. With `force` set the job is killed with SIGKILL
    /// instead of SIGTERM. Stopping an already-stopped job is not an error;
    /// callers that need a bound on the wait should wrap this in a timeout.
    pub async fn stop(&self, force: bool) -> i32 {
        if force {
            self.force_stop.cancel();
        } else {
            self.stop.cancel();
        }
        self.done.cancelled().await;
        // Never absent once done fires
        self.exit_code().await.unwrap_or(-1)
    }

    /// The exit code if the job has completed, or `None` while running. The
    /// code is -1 when the job completed without a determinable exit code.
    pub async fn exit_code(&self) -> Option<i32> {
        self.state.read().await.exit_code
    }

    /// Fires when the exit code has been recorded.
    pub(crate) fn done_token(&self) -> &CancellationToken {
        &self.done
    }

    /// Fires on the first soft stop request.
    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Fires on the first forced stop request.
    pub(crate) fn force_stop_token(&self) -> &CancellationToken {
        &self.force_stop
    }

    /// Append a chunk of captured output and wake listeners. The slice is
    /// copied; callers may reuse their buffer. Never called after
    /// [`Job::mark_done`].
    pub(crate) async fn append_output(&self, stderr: bool, data: &[u8]) {
        let mut state = self.state.write().await;
        let update = if stderr {
            state.stderr.extend_from_slice(data);
            JobUpdate::StderrAppended
        } else {
            state.stdout.extend_from_slice(data);
            JobUpdate::StdoutAppended
        };
        state.notify(update);
    }

    /// Record the final exit code. Output is frozen from this point on.
    pub(crate) async fn mark_done(&self, exit_code: i32) {
        let mut state = self.state.write().await;
        state.exit_code = Some(exit_code);
        state.notify(JobUpdate::Completed);
        drop(state);
        self.done.cancel();
    }
}
