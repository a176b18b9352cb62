//! One-shot convenience dialer: dial, write an input buffer, collect stdout/stderr, and wait for
//! exit, all within a single deadline (spec.md §11, `russ_dialv_wait_inouterr`).

use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::path::Path;

use russ_base::deadline::Deadline;

use crate::connection::cconn::ClientConn;
use crate::error::Error;
use crate::error::Result;
use crate::wire::ExitRecord;
use crate::wire::Request;
use crate::wire::WaitOutcome;

/// What [`dial_and_collect`] gathered: everything stdout/stderr produced before both closed, and
/// the exit outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: WaitOutcome,
    pub exit: Option<ExitRecord>,
}

/// Dials `saddr` with `req`, writes `input` to stdin (fd 0) if present and closes it, reads
/// stdout (fd 1) and stderr (fd 2) to EOF, then waits for the exit record — all subject to one
/// `deadline` (spec.md §11).
pub fn dial_and_collect(
    saddr: &Path,
    req: &Request,
    input: &[u8],
    deadline: Deadline,
) -> Result<Collected> {
    let mut conn = ClientConn::dial(saddr, req, deadline)?;

    if let Some(stdin) = conn.user_fd(0) {
        write_all_deadline(stdin, input, deadline)?;
        conn.take_user_fd(0);
    }

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_fd = conn.user_fd(1);
    let mut stderr_fd = conn.user_fd(2);

    while stdout_fd.is_some() || stderr_fd.is_some() {
        if deadline.has_expired() {
            return Err(Error::RussBase(russ_base::Error::DeadlineExpired));
        }

        let mut pollfds = Vec::new();
        if let Some(fd) = stdout_fd {
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if let Some(fd) = stderr_fd {
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout_ms = deadline.remaining_ms().min(i64::from(i32::MAX)) as i32;
        // SAFETY: `pollfds` is a valid, exclusively-owned buffer for the duration of the call.
        let ret =
            unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::RussBase(russ_base::Error::Sys(err)));
        }

        let mut idx = 0;
        if let Some(fd) = stdout_fd {
            if read_into(fd, &mut stdout_buf, pollfds[idx].revents) {
                stdout_fd = None;
            }
            idx += 1;
        }
        if let Some(fd) = stderr_fd {
            if read_into(fd, &mut stderr_buf, pollfds[idx].revents) {
                stderr_fd = None;
            }
        }
    }

    let (outcome, exit) = conn.wait(deadline)?;
    Ok(Collected {
        stdout: stdout_buf,
        stderr: stderr_buf,
        outcome,
        exit,
    })
}

/// Appends whatever is readable from `fd` into `buf`. Returns `true` if `fd` is done (EOF or
/// error) and should be dropped from the poll set.
fn read_into(fd: RawFd, buf: &mut Vec<u8>, revents: libc::c_short) -> bool {
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return true;
    }
    if revents & (libc::POLLIN | libc::POLLHUP) == 0 {
        return false;
    }
    let mut chunk = [0u8; 65536];
    // SAFETY: `chunk` is a correctly-sized, exclusively-owned stack buffer.
    let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
    if n <= 0 {
        return true;
    }
    buf.extend_from_slice(&chunk[..n as usize]);
    false
}

fn write_all_deadline(fd: RawFd, data: &[u8], deadline: Deadline) -> Result<()> {
    let file = BorrowedWriteFd(fd);
    russ_base::fd::writen_deadline(&file, data, deadline)
}

/// A borrowed fd wrapper so [`russ_base::fd::writen_deadline`] (generic over `AsRawFd`) can be
/// used without taking ownership of `fd`, which remains owned by the [`ClientConn`].
struct BorrowedWriteFd(RawFd);

impl AsRawFd for BorrowedWriteFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::fd::FromRawFd;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixListener;

    use russ_base::deadline::NEVER;

    use super::*;
    use crate::connection::sconn::ServerConn;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [-1; 2];
        // SAFETY: both fds were just created by a successful pipe(2) call.
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn dial_and_collect_gathers_echoed_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let saddr = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&saddr).unwrap();

        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut sconn = ServerConn::accept(sock).unwrap();
            let _req = sconn.await_request(NEVER).unwrap();

            let (stdin_read, stdin_write) = pipe();
            let (stdout_read, stdout_write) = pipe();
            sconn.set_user_fd(0, stdin_write);
            sconn.set_user_fd(1, stdout_read);
            let (exit_read, exit_write) = pipe();
            sconn.answer(exit_read, NEVER).unwrap();

            let mut buf = [0u8; 64];
            let n = unsafe {
                libc::read(
                    stdin_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            let n = n.max(0) as usize;
            unsafe {
                libc::write(
                    stdout_write.as_raw_fd(),
                    buf[..n].as_ptr() as *const libc::c_void,
                    n,
                )
            };
            drop(stdout_write);
            drop(stdin_read);

            ExitRecord::success().write_deadline(&exit_write, NEVER).unwrap();
        });

        let req = Request::new("execute", "/echo");
        let collected = dial_and_collect(&saddr, &req, b"ping", NEVER).unwrap();
        assert_eq!(collected.stdout, b"ping");
        assert_eq!(collected.outcome, WaitOutcome::Ok);
        assert_eq!(collected.exit.unwrap(), ExitRecord::success());
        server.join().unwrap();
    }
}
