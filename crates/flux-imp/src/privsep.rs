//! Privilege-separation channel.
//!
//! When the IMP runs setuid, it forks immediately: the child irrevocably
//! drops to the invoking user's identity and handles all untrusted input;
//! the parent retains privilege and acts only on the single request bundle
//! the child forwards. The two halves share a pair of cloexec pipes
//! carrying u32-little-endian length-prefixed JSON frames.
//!
//! Protocol: parent sends a one-byte go signal once its side is set up;
//! the child sends exactly one request bundle and exits; the parent treats
//! a nonzero child exit as an abort.

use std::fs::File;
use std::io::{Read, Write};

use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getgid, getuid, pipe2, ForkResult, Pid};

use crate::error::{die, ImpError};
use crate::input::ExecRequest;

/// Maximum serialized request size allowed across the channel.
const MAX_FRAME: usize = 4 * 1024 * 1024;

/// True when the process is running setuid-root on behalf of another user.
pub fn setuid_mode() -> bool {
    let euid = nix::unistd::geteuid();
    euid.is_root() && getuid() != euid
}

/// One endpoint of the privsep pipe pair.
pub struct Channel {
    reader: File,
    writer: File,
}

impl Channel {
    /// Sends the request bundle as one length-prefixed frame.
    pub fn send(&mut self, request: &ExecRequest) -> Result<(), ImpError> {
        let frame = serde_json::to_vec(request)
            .map_err(|e| ImpError::InputMalformed(format!("request encode error: {e}")))?;
        if frame.is_empty() || frame.len() > MAX_FRAME {
            return Err(ImpError::Privsep(format!(
                "request frame size {} out of range",
                frame.len()
            )));
        }
        let len = u32::try_from(frame.len())
            .map_err(|_| ImpError::Privsep("request frame too large".to_string()))?;
        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.writer.write_all(&frame))
            .and_then(|()| self.writer.flush())
            .map_err(|e| ImpError::io("privsep write", e))
    }

    /// Receives one length-prefixed request bundle.
    pub fn recv(&mut self) -> Result<ExecRequest, ImpError> {
        let mut len_bytes = [0u8; 4];
        self.reader
            .read_exact(&mut len_bytes)
            .map_err(|e| ImpError::io("privsep read", e))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_FRAME {
            return Err(ImpError::Privsep(format!(
                "privsep frame size {len} out of range"
            )));
        }
        let mut frame = vec![0u8; len];
        self.reader
            .read_exact(&mut frame)
            .map_err(|e| ImpError::io("privsep read", e))?;
        serde_json::from_slice(&frame)
            .map_err(|e| ImpError::InputMalformed(format!("privsep frame decode error: {e}")))
    }

    fn send_go(&mut self) -> Result<(), ImpError> {
        self.writer
            .write_all(&[0u8])
            .and_then(|()| self.writer.flush())
            .map_err(|e| ImpError::io("privsep wakeup", e))
    }

    fn recv_go(&mut self) -> Result<(), ImpError> {
        let mut byte = [0u8; 1];
        self.reader
            .read_exact(&mut byte)
            .map_err(|e| ImpError::io("privsep wait for parent", e))
    }
}

/// The privileged parent's handle on the unprivileged child.
pub struct Privsep {
    child: Pid,
    /// Channel to the unprivileged child.
    pub chan: Channel,
}

/// Forks the unprivileged half.
///
/// The child drops privilege, waits for the go byte, runs `child_main`,
/// and exits with its return value. Only the parent returns.
pub fn spawn<F>(child_main: F) -> Result<Privsep, ImpError>
where
    F: FnOnce(&mut Channel) -> i32,
{
    if !setuid_mode() {
        return Err(ImpError::Privsep(
            "privsep requires setuid invocation".to_string(),
        ));
    }

    // down: parent -> child (go byte); up: child -> parent (request).
    let (down_read, down_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| ImpError::errno("privsep pipe", e))?;
    let (up_read, up_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| ImpError::errno("privsep pipe", e))?;

    match unsafe { fork() }.map_err(|e| ImpError::errno("privsep fork", e))? {
        ForkResult::Child => {
            drop(down_write);
            drop(up_read);
            drop_privileges();
            let mut chan = Channel {
                reader: File::from(down_read),
                writer: File::from(up_write),
            };
            if let Err(err) = chan.recv_go() {
                die(format_args!("privsep child: {err}"));
            }
            std::process::exit(child_main(&mut chan));
        }
        ForkResult::Parent { child } => {
            drop(down_read);
            drop(up_write);
            let mut chan = Channel {
                reader: File::from(up_read),
                writer: File::from(down_write),
            };
            chan.send_go()?;
            Ok(Privsep { child, chan })
        }
    }
}

impl Privsep {
    /// Waits for the unprivileged child; a nonzero or signaled exit is an
    /// abort.
    pub fn wait_child(&mut self) -> Result<(), ImpError> {
        loop {
            match waitpid(self.child, None) {
                Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                Ok(WaitStatus::Exited(_, status)) => {
                    return Err(ImpError::Privsep(format!(
                        "unprivileged child exited with status {status}"
                    )));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Err(ImpError::Privsep(format!(
                        "unprivileged child killed by signal {signal}"
                    )));
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(ImpError::errno("waitpid unprivileged child", e)),
            }
        }
    }
}

/// Irrevocably drops to the real uid/gid. Fatal on any failure, including
/// a successful re-escalation probe.
fn drop_privileges() {
    let ruid = getuid();
    let rgid = getgid();

    if let Err(e) = nix::unistd::setresgid(rgid, rgid, rgid) {
        die(format_args!("setresgid: {e}"));
    }
    if let Err(e) = nix::unistd::setresuid(ruid, ruid, ruid) {
        die(format_args!("setresuid: {e}"));
    }

    // Privilege must be unrecoverable from here on.
    let probe = unsafe { libc::setreuid(libc::uid_t::MAX, 0) };
    if probe == 0 {
        die(format_args!(
            "irreversible switch to uid {ruid} failed"
        ));
    }
}
