//! cgroup v1 and root-pivot primitives used by the child-exec entrypoint.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use crate::worker::runner::nix_to_io;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CGROUP_PARENT: &str = "teleworker";

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("creating cgroup dir {path}: {source}")]
    CreateCgroup { path: PathBuf, source: io::Error },

    #[error("writing cgroup file {path}: {source}")]
    WriteCgroup { path: PathBuf, source: io::Error },

    #[error("creating proc in root mount: {0}")]
    CreateProcDir(#[source] io::Error),

    #[error("mounting proc: {0}")]
    MountProc(#[source] io::Error),

    #[error("mounting root: {0}")]
    BindRoot(#[source] io::Error),

    #[error("creating pivot old dir: {0}")]
    CreatePivotOld(#[source] io::Error),

    #[error("calling pivot root: {0}")]
    PivotRoot(#[source] io::Error),

    #[error("changing root dir: {0}")]
    Chdir(#[source] io::Error),

    #[error("unmounting pivot old dir: {0}")]
    UnmountOld(#[source] io::Error),

    #[error("removing pivot old dir: {0}")]
    RemoveOld(#[source] io::Error),
}

/// Directory of the group for a container within a cgroup v1 controller.
pub(crate) fn cgroup_dir(controller: &str, container_id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT)
        .join(controller)
        .join(CGROUP_PARENT)
        .join(container_id)
}

/// Creates the group directory, writes each `(file, value)` setting, then
/// joins the current process by writing "0" to cgroup.procs.
pub(crate) fn write_cgroup_settings(
    dir: &Path,
    settings: &[(&str, String)],
) -> Result<(), IsolationError> {
    fs::create_dir_all(dir).map_err(|source| IsolationError::CreateCgroup {
        path: dir.to_path_buf(),
        source,
    })?;
    for (file, value) in settings {
        let path = dir.join(file);
        fs::write(&path, value).map_err(|source| IsolationError::WriteCgroup { path, source })?;
    }
    let procs = dir.join("cgroup.procs");
    fs::write(&procs, "0").map_err(|source| IsolationError::WriteCgroup {
        path: procs,
        source,
    })?;
    Ok(())
}

/// Re-roots the current mount namespace at `target` and discards the old
/// root. `target` must be a directory; a proc filesystem is mounted inside it
/// first so the namespace still has one afterward.
pub(crate) fn pivot_root(target: &Path) -> Result<(), IsolationError> {
    let proc_dir = target.join("proc");
    fs::create_dir_all(&proc_dir).map_err(IsolationError::CreateProcDir)?;
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|err| IsolationError::MountProc(nix_to_io(err)))?;

    // pivot_root refuses the mount containing the current root, so bind the
    // target over itself first
    mount(
        Some(target),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| IsolationError::BindRoot(nix_to_io(err)))?;

    let pivot_old = target.join(".pivot_old");
    fs::create_dir_all(&pivot_old).map_err(IsolationError::CreatePivotOld)?;
    unistd::pivot_root(target, &pivot_old)
        .map_err(|err| IsolationError::PivotRoot(nix_to_io(err)))?;
    unistd::chdir("/").map_err(|err| IsolationError::Chdir(nix_to_io(err)))?;

    umount2("/.pivot_old", MntFlags::MNT_DETACH)
        .map_err(|err| IsolationError::UnmountOld(nix_to_io(err)))?;
    fs::remove_dir_all("/.pivot_old").map_err(IsolationError::RemoveOld)?;
    Ok(())
}
