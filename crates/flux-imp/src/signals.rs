//! Signal blocking and forwarding.
//!
//! The privileged parent blocks everything while the exec context is
//! under construction, forks, and only then installs forwarding handlers
//! for the job-control set; the child unblocks before anything fallible.
//! Only one exec pipeline is ever in flight per process, so the forward
//! target is a single process-wide cell. A negative target addresses a
//! process group.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, Signal,
    SigmaskHow};

use crate::error::ImpError;

/// Signals the parent forwards to the job shell.
pub const FORWARDED: [Signal; 8] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGCONT,
    Signal::SIGALRM,
    Signal::SIGWINCH,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward(signum: libc::c_int) {
    // Async-signal-safe: one atomic load and one kill(2).
    let target = FORWARD_TARGET.load(Ordering::Relaxed);
    if target != 0 {
        unsafe {
            libc::kill(target, signum);
        }
    }
}

/// Sets the pid (or negated process-group id) the handlers forward to.
pub fn set_forward_target(pid: i32) {
    FORWARD_TARGET.store(pid, Ordering::Relaxed);
}

/// Blocks every signal.
pub fn block_all() -> Result<(), ImpError> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None)
        .map_err(|e| ImpError::errno("failed to block signals", e))
}

/// Unblocks every signal.
pub fn unblock_all() -> Result<(), ImpError> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| ImpError::errno("failed to unblock signals", e))
}

/// Installs forwarding handlers for [`FORWARDED`] and sets the mask so
/// exactly those signals are deliverable.
pub fn install_forwarding() -> Result<(), ImpError> {
    let action = SigAction::new(
        SigHandler::Handler(forward),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    let mut mask = SigSet::all();
    for signal in FORWARDED {
        mask.remove(signal);
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            tracing::warn!("sigaction (signal={signal}): {e}");
        }
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .map_err(|e| ImpError::errno("failed to set signal mask", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_set_matches_job_control_signals() {
        assert_eq!(FORWARDED.len(), 8);
        assert!(FORWARDED.contains(&Signal::SIGTERM));
        assert!(FORWARDED.contains(&Signal::SIGWINCH));
        assert!(!FORWARDED.contains(&Signal::SIGKILL));
        assert!(!FORWARDED.contains(&Signal::SIGCHLD));
    }

    #[test]
    fn forward_target_cell_round_trip() {
        set_forward_target(12345);
        assert_eq!(FORWARD_TARGET.load(Ordering::Relaxed), 12345);
        // Negative target addresses a process group.
        set_forward_target(-12345);
        assert_eq!(FORWARD_TARGET.load(Ordering::Relaxed), -12345);
        set_forward_target(0);
    }
}
