//! Process fork/wait helpers used by the fork-mode server accept loop.

use std::os::unix::process::ExitStatusExt;
use std::process;

use log::warn;

use crate::error::Error;
use crate::error::Result;

pub type Pid = libc::pid_t;

/// A forked child process that has not yet been waited on.
///
/// Dropping a `Child` without calling [`wait`](Child::wait) logs a warning: a forked worker
/// that is never reaped becomes a zombie.
pub struct Child {
    pid: Pid,
}

impl Child {
    /// Blocks until this child exits, via `waitpid(2)`.
    pub fn wait(self) -> Result<u8> {
        let pid = self.into_pid();
        wait_for_pid(pid)
    }

    /// Gives up ownership of the pid without waiting for it, suppressing the drop warning.
    /// The caller becomes responsible for reaping the process (e.g. via a later blanket
    /// `waitpid(-1, ...)`).
    pub fn into_pid(self) -> Pid {
        let pid = self.pid;
        std::mem::forget(self);
        pid
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        warn!("child process {} was not waited on", self.pid);
    }
}

/// Blocking `waitpid(2)` on an already-known pid, decoding the exit status the way a RUSS
/// exit record encodes it: the process's exit code, or `128 + signal` if it died from a
/// signal.
pub fn wait_for_pid(pid: Pid) -> Result<u8> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is an exclusively-owned stack location and the return value is
        // checked.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Sys(err));
        }
        break;
    }
    let status = process::ExitStatus::from_raw(status);
    if let Some(code) = status.code() {
        Ok(code as u8)
    } else if let Some(signal) = status.signal() {
        Ok(128u8.saturating_add(signal as u8))
    } else {
        unreachable!("waitpid(..., 0) only returns exited or signaled status")
    }
}

/// Forks this process and calls `post_fork` in the child.
///
/// `post_fork` never returns under normal operation: the child exits with code `0` after it
/// completes, or `101` if it panics (mirroring Rust's own panic exit code, so a child crash is
/// distinguishable from deliberate `russ` exit statuses which stay in `0..=127`).
///
/// # Safety
///
/// As with any `fork(2)` wrapper, the calling process must be single-threaded, or the caller
/// must otherwise guarantee the post-fork child only touches async-signal-safe state until it
/// calls `post_fork` (which itself has no such restriction once running as the sole thread of
/// the new process).
pub unsafe fn fork_process<F>(post_fork: F) -> Result<Child>
where
    F: FnOnce(),
{
    // SAFETY: caller upholds the single-threaded contract documented above.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Sys(std::io::Error::last_os_error()));
    }
    if pid == 0 {
        struct ExitGuard;
        impl Drop for ExitGuard {
            fn drop(&mut self) {
                process::exit(101);
            }
        }
        let _exit_guard = ExitGuard;
        post_fork();
        process::exit(0);
    }
    Ok(Child { pid })
}

/// Detaches the calling process from its controlling terminal and session the way a daemon
/// does: `setsid(2)` followed by ignoring `SIGHUP`. Used by the grandchild of a double-fork
/// worker so that the middle process can exit immediately without orphaning the handler.
pub fn detach_session() -> Result<()> {
    // SAFETY: `setsid` takes no arguments; the return value is checked.
    let ret = unsafe { libc::setsid() };
    if ret < 0 {
        return Err(Error::Sys(std::io::Error::last_os_error()));
    }
    // SAFETY: installing `SIG_IGN` for `SIGHUP` is always safe and `signal(2)`'s return value
    // (the previous handler) is intentionally discarded.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_and_wait_reports_exit_code() {
        // SAFETY: this test process is single-threaded at the point of the call.
        let child = unsafe { fork_process(|| process::exit(7)) }.unwrap();
        let code = child.wait().unwrap();
        assert_eq!(code, 7);
    }
}
