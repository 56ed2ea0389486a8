//! Child process lifecycle: fork+exec with a per-slot environment
//! overlay, stdout/stderr reparented into a capture pipe, and SIGCHLD-
//! driven reaping.
//!
//! Grounded on the fork/exec/reap shape used for PTY children elsewhere
//! in this codebase's lineage, adapted from a PTY pair to a plain pipe
//! (no terminal here) and with the env overlay applied in the child
//! between fork and exec rather than inherited wholesale.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::libc;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::{ForkResult, Pid, execvp, fork, pipe};

/// Errors from spawning or reaping a child. All are fatal in the
/// caller except [`ChildError::Exec`] variants that originate from
/// user-supplied paths/argv, which the caller reports back over the
/// wire as the usual Result frame (exec failure shows up as exit 127
/// there, not as a `ChildError`).
#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("path or argument contains a null byte: {0:?}")]
    NulByte(String),
    #[error("pipe() failed: {0}")]
    Pipe(#[source] nix::Error),
    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("fcntl() failed: {0}")]
    Fcntl(#[source] nix::Error),
    #[error("waitid() failed: {0}")]
    Wait(#[source] nix::Error),
    #[error("kill() failed: {0}")]
    Kill(#[source] nix::Error),
}

/// A just-forked child: its PID and the read end of its capture pipe.
pub struct SpawnedChild {
    pub pid: Pid,
    pub capture_read: OwnedFd,
}

/// `CLD_EXITED` si_code: child exited via `_exit`/`return`.
pub const CLD_EXITED: u64 = 1;
/// `CLD_KILLED` si_code: child was killed by a signal.
pub const CLD_KILLED: u64 = 2;
/// `CLD_DUMPED` si_code: child was killed by a signal and dumped core.
pub const CLD_DUMPED: u64 = 3;

/// An exit report pulled off the SIGCHLD drain loop.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport {
    pub pid: u32,
    pub si_code: u64,
    pub si_status: u64,
}

/// Fork and exec `path` with `argv` tail and the resolved environment
/// overlay, wiring the child's stdout and stderr onto a shared pipe
/// whose read end is returned non-blocking.
///
/// Forks; in the parent closes the write end and returns the read end
/// for event-loop registration; in the child applies the env overlay,
/// dups the write end onto fd 1 and 2, then execs. Exec failure is
/// fatal in the child (`_exit(127)`), never observed here — it
/// surfaces to the controller as an ordinary exit code via the
/// subsequent Result frame.
///
/// # Safety
///
/// Only async-signal-safe calls are made between `fork()` and
/// `exec`/`_exit` in the child branch; all heap allocation (the
/// `CString` conversions) happens before the fork.
pub fn spawn(
    path: &str,
    argv: &[String],
    env: &[(String, String)],
) -> Result<SpawnedChild, ChildError> {
    let c_path =
        CString::new(path.as_bytes()).map_err(|_| ChildError::NulByte(path.to_string()))?;
    let mut c_argv = Vec::with_capacity(1 + argv.len());
    c_argv.push(c_path.clone());
    for a in argv {
        c_argv.push(CString::new(a.as_bytes()).map_err(|_| ChildError::NulByte(a.clone()))?);
    }
    let mut c_env = Vec::with_capacity(env.len());
    for (k, v) in env {
        let combined = format!("{k}={v}");
        c_env.push(
            CString::new(combined.clone()).map_err(|_| ChildError::NulByte(combined.clone()))?,
        );
    }

    let (read_end, write_end) = pipe().map_err(ChildError::Pipe)?;

    // SAFETY: between fork() and exec()/_exit() in the child branch,
    // only async-signal-safe functions are invoked.
    match unsafe { fork() }.map_err(ChildError::Fork)? {
        ForkResult::Parent { child } => {
            drop(write_end);
            nix::fcntl::fcntl(
                &read_end,
                nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
            )
            .map_err(ChildError::Fcntl)?;
            Ok(SpawnedChild {
                pid: child,
                capture_read: read_end,
            })
        }
        ForkResult::Child => {
            drop(read_end);
            let write_fd = write_end.as_raw_fd();
            if unsafe { libc::dup2(write_fd, 1) } < 0 || unsafe { libc::dup2(write_fd, 2) } < 0 {
                unsafe { libc::_exit(127) };
            }
            if write_fd > 2 {
                drop(write_end);
            } else {
                std::mem::forget(write_end);
            }
            for fd in 3..1024 {
                unsafe { libc::close(fd) };
            }
            // Apply the slot's env overlay in the child, between fork and
            // exec — overlays never affect already-running children;
            // they are only ever composed here.
            for kv in &c_env {
                unsafe { libc::putenv(kv.clone().into_raw()) };
            }
            let _ = execvp::<CString>(&c_argv[0], &c_argv);
            unsafe { libc::_exit(127) };
        }
    }
}

/// Send `SIGKILL` to `pid`. A missing process (`ESRCH`) is silently
/// ignored — Kill is idempotent; any other failure is fatal.
pub fn kill(pid: u32) -> Result<(), ChildError> {
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), nix::sys::signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(ChildError::Kill(e)),
    }
}

/// Drain all currently-reapable children via `waitid(P_ALL, WNOHANG)`,
/// translating each into an [`ExitReport`]. Called once per SIGCHLD
/// wakeup; may return zero or more reports since signals coalesce.
pub fn drain_exits() -> Result<Vec<ExitReport>, ChildError> {
    let mut reports = Vec::new();
    loop {
        let status = waitid(Id::All, WaitPidFlag::WNOHANG | WaitPidFlag::WEXITED)
            .map_err(ChildError::Wait)?;
        match status {
            WaitStatus::Exited(pid, code) => reports.push(ExitReport {
                pid: pid.as_raw() as u32,
                si_code: CLD_EXITED,
                si_status: code as u64,
            }),
            WaitStatus::Signaled(pid, sig, dumped) => reports.push(ExitReport {
                pid: pid.as_raw() as u32,
                si_code: if dumped { CLD_DUMPED } else { CLD_KILLED },
                si_status: sig as u64,
            }),
            WaitStatus::StillAlive => break,
            _ => break,
        }
    }
    Ok(reports)
}

/// Read up to `buf.len()` bytes from a slot's capture pipe, classifying
/// the result the way the event loop needs it: `Ok(0)` means EOF (close
/// the fd), `Err(EAGAIN)` means no data is ready right now.
pub fn read_capture(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    nix::unistd::read(fd, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_until_exited(pid: Pid) -> ExitReport {
        for _ in 0..200 {
            let reports = drain_exits().unwrap();
            if let Some(r) = reports.into_iter().find(|r| r.pid == pid.as_raw() as u32) {
                return r;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child {pid} never reaped");
    }

    #[test]
    fn spawn_true_exits_cleanly() {
        let child = spawn("/bin/true", &[], &[]).unwrap();
        let report = wait_until_exited(child.pid);
        assert_eq!(report.si_code, CLD_EXITED);
        assert_eq!(report.si_status, 0);
    }

    #[test]
    fn spawn_false_reports_nonzero_status() {
        let child = spawn("/bin/false", &[], &[]).unwrap();
        let report = wait_until_exited(child.pid);
        assert_eq!(report.si_code, CLD_EXITED);
        assert_eq!(report.si_status, 1);
    }

    #[test]
    fn capture_pipe_carries_stdout_and_stderr() {
        let child = spawn(
            "/bin/sh",
            &["-c".to_string(), "echo hi".to_string()],
            &[],
        )
        .unwrap();
        let fd = child.capture_read.as_raw_fd();
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match read_capture(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(nix::Error::EAGAIN) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("read error: {e}"),
            }
        }
        assert_eq!(collected, b"hi\n");
        wait_until_exited(child.pid);
    }

    #[test]
    fn env_overlay_is_visible_to_child() {
        let child = spawn(
            "/bin/sh",
            &["-c".to_string(), "echo $LTX_TEST_VAR".to_string()],
            &[("LTX_TEST_VAR".to_string(), "marker-value".to_string())],
        )
        .unwrap();
        let fd = child.capture_read.as_raw_fd();
        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match read_capture(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(nix::Error::EAGAIN) => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("read error: {e}"),
            }
        }
        assert_eq!(collected, b"marker-value\n");
        wait_until_exited(child.pid);
    }

    #[test]
    fn kill_on_missing_pid_is_a_noop() {
        // An implausibly large pid is extremely unlikely to exist.
        kill(999_999_999).unwrap();
    }

    #[test]
    fn nul_byte_in_path_rejected() {
        let err = spawn("bad\0path", &[], &[]).unwrap_err();
        assert!(matches!(err, ChildError::NulByte(_)));
    }
}
