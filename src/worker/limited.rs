//! Runner that starts jobs inside fresh kernel namespaces by re-executing
//! this binary as the child-exec helper, which applies cgroup limits and the
//! optional root pivot before running the user command.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, Pid};

use crate::error::{Result, WorkerError};
use crate::worker::job::Job;
use crate::worker::runner::{nix_to_io, supervise, ChildProc, ChildWaiter, JobLimitArgs, JobLimitConfig};
use crate::worker::CHILD_EXEC_ARG;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

pub(crate) struct LimitedRunner {
    config: JobLimitConfig,
}

impl LimitedRunner {
    pub(crate) fn new(mut config: JobLimitConfig) -> Result<Self> {
        let limits = &mut config.resource_limits;
        if (limits.cpu_max_period == 0) != (limits.cpu_max_quota == 0) {
            return Err(WorkerError::InvalidCpuLimits);
        }
        // Resolve the empty-string device key to the device holding this
        // executable.
        if limits.device_io_max.get("").copied().unwrap_or(0) > 0 {
            if let Some(limit) = limits.device_io_max.remove("") {
                let exe = std::env::current_exe().map_err(WorkerError::DeviceInfo)?;
                let stat = nix::sys::stat::stat(&exe)
                    .map_err(|err| WorkerError::DeviceInfo(nix_to_io(err)))?;
                let dev = stat.st_dev;
                limits
                    .device_io_max
                    .insert(format!("{}:{}", dev / 256, dev % 256), limit);
            }
        }
        Ok(Self { config })
    }

    pub(crate) async fn start(&self, job: &Arc<Job>) -> Result<()> {
        // The limit args ride along as the first parameter of the re-exec
        let limit_args = JobLimitArgs {
            resource_limits: self.config.resource_limits.clone(),
            root_mount: job.root_fs().map(str::to_string),
        };
        let encoded = serde_json::to_string(&limit_args)
            .map_err(|err| WorkerError::Start(io::Error::other(err)))?;

        let mut flags =
            CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUSER;
        if self.config.isolation.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.config.isolation.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.config.isolation.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }

        let child = spawn_in_namespaces(&encoded, job.command(), job.args(), flags)?;
        supervise(job.clone(), child);
        Ok(())
    }
}

/// Clones the child-exec helper into the requested namespaces with piped
/// stdout/stderr. The helper is gated on a pipe until the parent has written
/// its uid/gid maps (host id -> container root, size 1), like the maps a
/// privileged runtime would apply between clone and exec.
fn spawn_in_namespaces(
    limit_args: &str,
    command: &str,
    args: &[String],
    flags: CloneFlags,
) -> Result<ChildProc> {
    let (stdout_read, stdout_write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(nix_to_io)?;
    let (stderr_read, stderr_write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(nix_to_io)?;
    let (gate_read, gate_write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(nix_to_io)?;
    let stdin = std::fs::File::open("/dev/null").map_err(WorkerError::Start)?;

    let program = cstring("/proc/self/exe")?;
    let mut argv = vec![
        program.clone(),
        cstring(CHILD_EXEC_ARG)?,
        cstring(limit_args)?,
        cstring(command)?,
    ];
    for arg in args {
        argv.push(cstring(arg)?);
    }

    // execv wants a null-terminated pointer array; the child's copy of the
    // address space keeps these pointers valid until exec
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let stdin_fd = stdin.as_raw_fd();
    let stdout_fd = stdout_write.as_raw_fd();
    let stderr_fd = stderr_write.as_raw_fd();
    let gate_fd = gate_read.as_raw_fd();
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // The callback runs in the cloned child inside the new namespaces; only
    // async-signal-safe calls are allowed until exec.
    let child_main = Box::new(move || -> isize {
        unsafe {
            let mut byte = 0u8;
            if libc::read(gate_fd, (&mut byte as *mut u8).cast(), 1) != 1 {
                return 127;
            }
            if libc::dup2(stdin_fd, 0) < 0
                || libc::dup2(stdout_fd, 1) < 0
                || libc::dup2(stderr_fd, 2) < 0
            {
                return 127;
            }
            libc::execv(program.as_ptr(), argv_ptrs.as_ptr());
        }
        127
    });

    let pid = unsafe { clone(child_main, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|err| WorkerError::Start(nix_to_io(err)))?;
    drop(stdout_write);
    drop(stderr_write);
    drop(stdin);

    if let Err(err) = write_id_maps(pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        return Err(WorkerError::Start(err));
    }
    // Release the gated child to exec
    if let Err(err) = unistd::write(&gate_write, &[1]) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        return Err(WorkerError::Start(nix_to_io(err)));
    }
    drop(gate_write);
    drop(gate_read);

    Ok(ChildProc {
        pid: pid.as_raw(),
        stdout: Box::new(pipe_reader(stdout_read)),
        stderr: Box::new(pipe_reader(stderr_read)),
        waiter: ChildWaiter::Cloned(pid),
    })
}

/// Maps the child to root inside its user namespace.
fn write_id_maps(pid: Pid) -> io::Result<()> {
    // setgroups must be denied before an unprivileged gid_map write
    fs::write(format!("/proc/{pid}/setgroups"), "deny")?;
    fs::write(
        format!("/proc/{pid}/gid_map"),
        format!("0 {} 1\n", unistd::getgid()),
    )?;
    fs::write(
        format!("/proc/{pid}/uid_map"),
        format!("0 {} 1\n", unistd::getuid()),
    )?;
    Ok(())
}

fn pipe_reader(fd: OwnedFd) -> tokio::fs::File {
    tokio::fs::File::from_std(std::fs::File::from(fd))
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|err| WorkerError::Start(io::Error::other(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::worker::runner::{JobIsolation, JobResourceLimits};

    #[test]
    fn test_rejects_half_configured_cpu_limit() {
        let config = JobLimitConfig {
            resource_limits: JobResourceLimits {
                cpu_max_period: 10000,
                ..Default::default()
            },
            isolation: JobIsolation::default(),
        };
        assert!(matches!(
            LimitedRunner::new(config),
            Err(WorkerError::InvalidCpuLimits)
        ));
    }

    #[test]
    fn test_resolves_default_device_key() {
        let config = JobLimitConfig {
            resource_limits: JobResourceLimits {
                device_io_max: HashMap::from([(String::new(), 1024)]),
                ..Default::default()
            },
            isolation: JobIsolation::default(),
        };
        let runner = LimitedRunner::new(config).unwrap();
        let devices = &runner.config.resource_limits.device_io_max;
        assert!(!devices.contains_key(""));
        let (device, limit) = devices.iter().next().unwrap();
        assert!(device.contains(':'), "expected major:minor, got {device}");
        assert_eq!(*limit, 1024);
    }

    #[test]
    fn test_zero_default_device_key_is_kept() {
        let config = JobLimitConfig {
            resource_limits: JobResourceLimits {
                device_io_max: HashMap::from([(String::new(), 0)]),
                ..Default::default()
            },
            isolation: JobIsolation::default(),
        };
        let runner = LimitedRunner::new(config).unwrap();
        assert!(runner.config.resource_limits.device_io_max.contains_key(""));
    }
}
