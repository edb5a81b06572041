//! Irrevocable user switching for the forked job shell.

use std::ffi::CString;

use nix::unistd::{Uid, User};

use crate::error::{die, ImpError};

/// Resolves a uid to its account entry. The target of an exec must be a
/// real account on this host.
pub fn lookup(userid: u32) -> Result<User, ImpError> {
    match User::from_uid(Uid::from_raw(userid)) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => {
            let hostname = nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            Err(ImpError::PolicyDenied(format!(
                "userid {userid} is invalid on {hostname}"
            )))
        }
        Err(e) => Err(ImpError::errno(format!("lookup userid={userid}"), e)),
    }
}

/// Switches real, effective, and saved uid/gid plus supplementary groups
/// to `target`, then verifies privilege cannot be restored.
///
/// Runs in the forked child between privilege and exec; every failure is
/// fatal.
pub fn switch_user(target: &User) {
    let name = match CString::new(target.name.as_str()) {
        Ok(name) => name,
        Err(_) => die(format_args!("user name {:?} contains NUL", target.name)),
    };

    if let Err(e) = nix::unistd::initgroups(&name, target.gid) {
        die(format_args!("initgroups: {e}"));
    }
    if let Err(e) = nix::unistd::setresgid(target.gid, target.gid, target.gid) {
        die(format_args!("setresgid: {e}"));
    }
    if let Err(e) = nix::unistd::setresuid(target.uid, target.uid, target.uid) {
        die(format_args!("setresuid: {e}"));
    }

    // Privilege must be unrecoverable after the switch.
    if unsafe { libc::setreuid(libc::uid_t::MAX, 0) } == 0 {
        die(format_args!(
            "irreversible switch to uid {} failed",
            target.uid
        ));
    }
}
