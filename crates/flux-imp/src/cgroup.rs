//! Cgroup reaper: find the IMP's cgroup and drain lingering processes.
//!
//! Detection handles both hierarchy flavors: a cgroup2 mount at
//! `/sys/fs/cgroup` (or `/sys/fs/cgroup/unified`) is the unified (v2)
//! layout; a tmpfs there with a legacy cgroupfs at
//! `/sys/fs/cgroup/systemd` is v1. The reaper only arms itself when the
//! cgroup's basename starts with `imp-shell`, i.e. when the job execution
//! system put this IMP in a dedicated per-job cgroup.
//!
//! Draining polls `cgroup.procs`; inotify and poll(2) do not work on that
//! virtual file.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, CGROUP_SUPER_MAGIC, TMPFS_MAGIC};
use nix::unistd::Pid;

use crate::error::ImpError;

/// Upper bound on a `cgroup.procs` read (64 KiB).
const MAX_PROCS_READ: usize = 64 * 1024;

/// Cgroup basename prefix that arms the reaper.
const ARMED_PREFIX: &str = "imp-shell";

/// A discovered cgroup placement for the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupInfo {
    /// Cgroup filesystem mount directory.
    pub mount_dir: PathBuf,
    /// Absolute path of this process's cgroup.
    pub path: PathBuf,
    /// Unified (v2) vs legacy (v1) hierarchy.
    pub unified: bool,
    /// Whether the drain loop is armed for this placement.
    use_cgroup_kill: bool,
}

impl CgroupInfo {
    /// Discovers the mount flavor and this process's cgroup path.
    ///
    /// # Errors
    ///
    /// Fails when no supported cgroup mount is found or no matching line
    /// exists in `/proc/self/cgroup`.
    pub fn detect() -> Result<Self, ImpError> {
        let (mount_dir, unified) = detect_mount()?;
        let contents = std::fs::read_to_string("/proc/self/cgroup")
            .map_err(|e| ImpError::io("read /proc/self/cgroup", e))?;
        let path = resolve_path(&contents, unified, &mount_dir).ok_or_else(|| {
            ImpError::Cgroup("no matching line in /proc/self/cgroup".to_string())
        })?;
        Ok(Self::from_parts(mount_dir, path, unified))
    }

    /// Builds the info from already-resolved parts, applying the arming
    /// rule.
    fn from_parts(mount_dir: PathBuf, path: PathBuf, unified: bool) -> Self {
        let use_cgroup_kill = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(ARMED_PREFIX));
        Self {
            mount_dir,
            path,
            unified,
            use_cgroup_kill,
        }
    }

    /// Whether [`wait_for_empty`](Self::wait_for_empty) will drain.
    #[must_use]
    pub fn armed(&self) -> bool {
        self.use_cgroup_kill
    }

    /// Signals every process in the cgroup except the caller.
    ///
    /// `signal` of `None` probes with signal 0. Individual send failures
    /// are logged and skipped; the call only fails when nothing was
    /// signaled and at least one send failed.
    ///
    /// # Errors
    ///
    /// Fails when `cgroup.procs` cannot be read or, as above, when every
    /// send failed.
    pub fn kill_all(&self, signal: Option<Signal>) -> Result<usize, ImpError> {
        let procs_path = self.path.join("cgroup.procs");
        let contents = read_bounded(&procs_path)?;
        let current = Pid::this();

        let mut count = 0usize;
        let mut last_err: Option<Errno> = None;
        for pid in parse_procs(&contents) {
            let pid = Pid::from_raw(pid);
            if pid == current {
                continue;
            }
            match kill(pid, signal) {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!("failed to send signal {signal:?} to pid {pid}");
                    last_err = Some(e);
                }
            }
        }
        match (count, last_err) {
            (0, Some(e)) => Err(ImpError::errno("cgroup kill", e)),
            _ => Ok(count),
        }
    }

    /// Polls until the cgroup holds no process other than the caller.
    /// No-op unless armed.
    ///
    /// Probes once a second; when the sleep is interrupted by a signal, a
    /// short settle delay lets just-terminated processes disappear from
    /// `cgroup.procs` before the next probe.
    pub fn wait_for_empty(&self) {
        if !self.use_cgroup_kill {
            return;
        }
        loop {
            match self.kill_all(None) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let rc = unsafe { libc::usleep(1_000_000) };
                    if rc < 0 && Errno::last() == Errno::EINTR {
                        unsafe {
                            libc::usleep(2_000);
                        }
                    }
                }
            }
        }
    }
}

/// Finds the cgroup filesystem mount and hierarchy flavor.
fn detect_mount() -> Result<(PathBuf, bool), ImpError> {
    let root = Path::new("/sys/fs/cgroup");
    let root_fs = statfs(root).map_err(|e| ImpError::errno("statfs /sys/fs/cgroup", e))?;
    if root_fs.filesystem_type() == CGROUP2_SUPER_MAGIC {
        return Ok((root.to_path_buf(), true));
    }

    let unified = Path::new("/sys/fs/cgroup/unified");
    if let Ok(fs) = statfs(unified) {
        if fs.filesystem_type() == CGROUP2_SUPER_MAGIC {
            return Ok((unified.to_path_buf(), true));
        }
    }

    if root_fs.filesystem_type() == TMPFS_MAGIC {
        let systemd = Path::new("/sys/fs/cgroup/systemd");
        if let Ok(fs) = statfs(systemd) {
            if fs.filesystem_type() == CGROUP_SUPER_MAGIC {
                return Ok((systemd.to_path_buf(), false));
            }
        }
    }

    Err(ImpError::Cgroup(
        "unable to determine cgroup mount point".to_string(),
    ))
}

/// Selects this process's cgroup path from `/proc/self/cgroup` contents.
///
/// Lines have the form `hierarchy:subsystems:relpath`. The unified
/// hierarchy is the line with an empty subsystem field; legacy systemd is
/// `name=systemd`. Leading `/..` segments (a containerized cgroup root)
/// are stripped from the relative path.
fn resolve_path(contents: &str, unified: bool, mount_dir: &Path) -> Option<PathBuf> {
    for line in contents.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next()?;
        let Some(subsys) = fields.next() else {
            continue;
        };
        let Some(relpath) = fields.next() else {
            continue;
        };

        let selected = if unified {
            subsys.is_empty()
        } else {
            subsys == "name=systemd"
        };
        if !selected {
            continue;
        }

        let mut relpath = relpath;
        while let Some(stripped) = relpath.strip_prefix("/..") {
            relpath = stripped;
        }
        return Some(PathBuf::from(format!(
            "{}{relpath}",
            mount_dir.display()
        )));
    }
    None
}

/// Extracts pids from `cgroup.procs` contents, skipping anything that is
/// not an integer.
fn parse_procs(contents: &str) -> impl Iterator<Item = i32> + '_ {
    contents
        .split_ascii_whitespace()
        .filter_map(|token| token.parse::<i32>().ok())
}

/// Bounded read of a cgroup virtual file.
fn read_bounded(path: &Path) -> Result<String, ImpError> {
    let file =
        File::open(path).map_err(|e| ImpError::io(format!("open {}", path.display()), e))?;
    let mut contents = String::new();
    file.take(MAX_PROCS_READ as u64 + 1)
        .read_to_string(&mut contents)
        .map_err(|e| ImpError::io(format!("read {}", path.display()), e))?;
    if contents.len() > MAX_PROCS_READ {
        return Err(ImpError::InputMalformed(format!(
            "{} exceeds {MAX_PROCS_READ} bytes",
            path.display()
        )));
    }
    Ok(contents)
}
