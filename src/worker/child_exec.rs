//! Entrypoint for the re-executed worker binary. Runs inside the namespaces
//! the limited runner cloned it into, applies cgroup limits and the optional
//! root pivot, then runs the user command and exits with its code.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use uuid::Uuid;

use crate::worker::isolation::{self, IsolationError};
use crate::worker::runner::JobLimitArgs;

#[derive(Debug, Error)]
pub enum ChildExecError {
    #[error("invalid arg count")]
    InvalidArgCount,

    #[error("invalid child exec args: {0}")]
    InvalidLimitArgs(#[from] serde_json::Error),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error("running user command: {0}")]
    Run(#[from] std::io::Error),
}

/// Created cgroup directories, removed best-effort when the child exits.
#[derive(Default)]
struct CgroupCleanup(Vec<PathBuf>);

impl Drop for CgroupCleanup {
    fn drop(&mut self) {
        for dir in &self.0 {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Runs the child-exec entrypoint: `args[0]` is the JSON-encoded limit args,
/// the rest is the user command and its arguments. Returns the user command's
/// exit code (-1 when it was killed by a signal), or an error if anything
/// failed before the command could run.
pub fn run(args: &[String]) -> Result<i32, ChildExecError> {
    if args.len() < 2 {
        return Err(ChildExecError::InvalidArgCount);
    }
    let limit_args: JobLimitArgs = serde_json::from_str(&args[0])?;
    // Fresh container id even if there are no limits
    let container_id = Uuid::new_v4().to_string();
    let mut cgroups = CgroupCleanup::default();

    let limits = &limit_args.resource_limits;
    if limits.cpu_max_period > 0 && limits.cpu_max_quota > 0 {
        apply_cgroup(
            &mut cgroups,
            "cpu",
            &container_id,
            &[
                ("cpu.cfs_period_us", limits.cpu_max_period.to_string()),
                ("cpu.cfs_quota_us", limits.cpu_max_quota.to_string()),
            ],
        )?;
    }
    if limits.memory_max > 0 {
        apply_cgroup(
            &mut cgroups,
            "memory",
            &container_id,
            &[
                ("memory.limit_in_bytes", limits.memory_max.to_string()),
                ("memory.memsw.limit_in_bytes", limits.memory_max.to_string()),
            ],
        )?;
    }
    if !limits.device_io_max.is_empty() {
        let value = limits
            .device_io_max
            .iter()
            .map(|(device, bps)| format!("{device}  {bps}"))
            .collect::<Vec<_>>()
            .join("\n");
        apply_cgroup(
            &mut cgroups,
            "blkio",
            &container_id,
            &[
                ("blkio.throttle.read_bps_device", value.clone()),
                ("blkio.throttle.write_bps_device", value),
            ],
        )?;
    }

    if let Some(root) = limit_args.root_mount.as_deref().filter(|root| !root.is_empty()) {
        isolation::pivot_root(Path::new(root))?;
    }

    // Stdio is inherited rather than redirected to /dev/null, which may not
    // exist after the pivot
    let status = Command::new(&args[1]).args(&args[2..]).status()?;
    Ok(status.code().unwrap_or(-1))
}

fn apply_cgroup(
    cleanup: &mut CgroupCleanup,
    controller: &str,
    container_id: &str,
    settings: &[(&str, String)],
) -> Result<(), IsolationError> {
    let dir = isolation::cgroup_dir(controller, container_id);
    // Registered for removal before the writes so a half-created group is
    // still cleaned up
    cleanup.0.push(dir.clone());
    isolation::write_cgroup_settings(&dir, settings)
}
