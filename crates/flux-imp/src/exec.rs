//! The exec pipeline: launch a job shell as the user attested by the
//! signed request.
//!
//! Setuid mode splits the work across the privsep boundary. The
//! unprivileged half gathers and validates input under the caller's
//! identity and forwards one request bundle; the privileged half trusts
//! nothing from that bundle except as input to signature verification,
//! re-derives the target user from the token, and performs the fork /
//! user switch / exec. Without setuid privilege the IMP can only exec
//! directly as the caller, and only where configuration allows it.

use std::ffi::CString;
use std::path::Path;
use std::process::ExitCode;

use imp_core::{ExecConfig, SecurityContext, UnwrapMode};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid, User};

use crate::cgroup::CgroupInfo;
use crate::error::{die, ImpError};
use crate::input::{self, ExecRequest};
use crate::privsep::{self, Channel, Privsep};
use crate::signals;
use crate::user;

/// Entry point for `flux-imp exec`.
pub fn run(shell_path: &Path, args: &[String]) -> Result<ExitCode, ImpError> {
    if privsep::setuid_mode() {
        let shell = shell_path.to_path_buf();
        let args = args.to_vec();
        let ps = privsep::spawn(move |chan| unprivileged_send(chan, &shell, &args))?;
        privileged_run(ps)
    } else {
        unprivileged_exec(shell_path, args)
    }
}

/// Unprivileged half in setuid mode: runs in the forked child after the
/// privilege drop. Returns the child's exit status.
fn unprivileged_send(chan: &mut Channel, shell_path: &Path, args: &[String]) -> i32 {
    match try_unprivileged_send(chan, shell_path, args) {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("exec: {err}");
            1
        }
    }
}

fn try_unprivileged_send(
    chan: &mut Channel,
    shell_path: &Path,
    args: &[String],
) -> Result<(), ImpError> {
    let mut ctx = SecurityContext::configure(None)?;
    let config = exec_config(&ctx)?;
    check_caller_allowed(&config)?;

    let request = input::read_request(shell_path, args)?;

    // Fail fast on a bad token; the parent still re-verifies.
    let _ = ctx.sign_unwrap(&request.token, UnwrapMode::Verify)?;

    if !shell_allowed(&config, &request.shell_path) {
        return Err(ImpError::PolicyDenied(
            "shell not in allowed-shells list".to_string(),
        ));
    }
    chan.send(&request)
}

/// Privileged half: verify, switch user, run the shell, reap.
fn privileged_run(mut ps: Privsep) -> Result<ExitCode, ImpError> {
    // Nothing may interrupt construction of the exec context; forwarding
    // is installed after the fork.
    signals::block_all()?;

    let mut ctx = SecurityContext::configure(None)?;
    let config = exec_config(&ctx)?;
    check_caller_allowed(&config)?;

    let request = ps.chan.recv()?;

    // The token is the sole authority on the target user.
    let target_uid = {
        let unwrapped = ctx.sign_unwrap(&request.token, UnwrapMode::Verify)?;
        unwrapped.userid
    };
    let target = user::lookup(target_uid)?;
    if target.uid.is_root() {
        return Err(ImpError::PolicyDenied(
            "switching to user root not supported".to_string(),
        ));
    }
    if !shell_allowed(&config, &request.shell_path) {
        return Err(ImpError::PolicyDenied(
            "shell not in allowed-shells list".to_string(),
        ));
    }

    ps.wait_child()?;

    #[cfg(feature = "pam")]
    let pam_session = if config.pam_support {
        Some(crate::pam::PamSession::open(&target.name)?)
    } else {
        None
    };
    #[cfg(not(feature = "pam"))]
    if config.pam_support {
        return Err(ImpError::PolicyDenied(
            "pam-support=true, but flux-imp was built without the pam feature".to_string(),
        ));
    }

    // Discover the cgroup before the job starts; the drain decision
    // depends on the placement the execution system chose for us.
    let cgroup = match CgroupInfo::detect() {
        Ok(info) => Some(info),
        Err(err) => {
            tracing::debug!("cgroup detection: {err}");
            None
        }
    };

    match unsafe { fork() }.map_err(|e| ImpError::errno("fork", e))? {
        ForkResult::Child => {
            if let Err(err) = signals::unblock_all() {
                die(format_args!("{err}"));
            }
            user::switch_user(&target);
            exec_shell(&request);
        }
        ForkResult::Parent { child } => {
            signals::set_forward_target(child.as_raw());
            signals::install_forwarding()?;

            let status = wait_for(child)?;

            if let Some(cgroup) = &cgroup {
                cgroup.wait_for_empty();
            }

            #[cfg(feature = "pam")]
            if let Some(session) = pam_session {
                session.close();
            }

            Ok(ExitCode::from(map_wait_status(&status)))
        }
    }
}

/// Direct-exec mode for installs without setuid privilege. Test
/// configurations only; requires `allow-unprivileged-exec`.
fn unprivileged_exec(shell_path: &Path, args: &[String]) -> Result<ExitCode, ImpError> {
    let mut ctx = SecurityContext::configure(None)?;
    let config = exec_config(&ctx)?;
    check_caller_allowed(&config)?;

    let request = input::read_request(shell_path, args)?;
    let _ = ctx.sign_unwrap(&request.token, UnwrapMode::Verify)?;

    if !config.allow_unprivileged_exec {
        return Err(ImpError::PolicyDenied(
            "IMP not installed setuid, operation disabled".to_string(),
        ));
    }
    tracing::warn!("Running without privilege, userid switching not available");
    exec_shell(&request);
}

/// Replaces the process image with the job shell. Never returns: exits
/// 126 when the shell exists but may not be executed, 127 on any other
/// exec failure.
fn exec_shell(request: &ExecRequest) -> ! {
    if let Err(e) = nix::unistd::chdir("/") {
        die(format_args!("exec: failed to chdir to /: {e}"));
    }

    let shell = match CString::new(request.shell_path.display().to_string()) {
        Ok(shell) => shell,
        Err(_) => die(format_args!("exec: shell path contains NUL")),
    };
    let mut argv = Vec::with_capacity(request.args.len());
    for arg in &request.args {
        match CString::new(arg.as_str()) {
            Ok(arg) => argv.push(arg),
            Err(_) => die(format_args!("exec: argument contains NUL")),
        }
    }

    let errno = match nix::unistd::execvp(&shell, &argv) {
        Err(e) => e,
        // execvp only returns on failure.
        Ok(infallible) => match infallible {},
    };
    let exit_code = if matches!(errno, Errno::EPERM | Errno::EACCES) {
        126
    } else {
        127
    };
    tracing::error!("{}: {errno}", request.shell_path.display());
    std::process::exit(exit_code);
}

/// Maps the reaped child status onto the IMP's own exit code.
fn map_wait_status(status: &WaitStatus) -> u8 {
    match status {
        WaitStatus::Exited(_, code) => exit_byte(*code),
        WaitStatus::Signaled(_, signal, _) => exit_byte(128 + *signal as i32),
        _ => 1,
    }
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code & 0xff).unwrap_or(1)
}

fn wait_for(child: Pid) -> Result<WaitStatus, ImpError> {
    loop {
        match waitpid(child, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(status)
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => return Err(ImpError::errno("waitpid", e)),
        }
    }
}

fn exec_config(ctx: &SecurityContext) -> Result<ExecConfig, ImpError> {
    ctx.config()
        .exec
        .clone()
        .ok_or_else(|| ImpError::Config(imp_core::ConfigError::Missing { table: "exec" }))
}

/// Checks the invoking user (real uid) against `allowed-users`.
fn check_caller_allowed(config: &ExecConfig) -> Result<(), ImpError> {
    let caller = caller_user()?;
    if !config.allowed_users.iter().any(|name| *name == caller.name) {
        return Err(ImpError::PolicyDenied(format!(
            "user {} not in allowed-users list",
            caller.name
        )));
    }
    Ok(())
}

fn caller_user() -> Result<User, ImpError> {
    match User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ImpError::PolicyDenied(
            "failed to find IMP user".to_string(),
        )),
        Err(e) => Err(ImpError::errno("lookup IMP user", e)),
    }
}

fn shell_allowed(config: &ExecConfig, shell_path: &Path) -> bool {
    let shell = shell_path.display().to_string();
    config.allowed_shells.iter().any(|allowed| *allowed == shell)
}
