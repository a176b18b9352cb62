//! Client-side connection: dial a service path, collect the fds the answer carries, and wait
//! for the server's exit record (spec.md §3 "Connection object — client view", §4.4).

use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use russ_base::deadline::Deadline;
use russ_base::fd::poll_status;
use russ_base::fd::writen_deadline;

use crate::connection::answer::Answer;
use crate::error::Error;
use crate::error::Result;
use crate::wire::ExitRecord;
use crate::wire::Request;
use crate::wire::WaitOutcome;

/// A dialed connection, holding the descriptors an [`Answer`] carried back. The control socket
/// itself is not kept: spec.md §4.2 closes it as soon as the answer has been received.
pub struct ClientConn {
    user_fds: Vec<Option<OwnedFd>>,
    exit_fd: Option<OwnedFd>,
}

impl ClientConn {
    /// Connects to `saddr`, sends `req`, and receives the answer, subject to `deadline`.
    pub fn dial(saddr: &Path, req: &Request, deadline: Deadline) -> Result<ClientConn> {
        let sock = UnixStream::connect(saddr).map_err(russ_base::Error::Sys)?;
        let body = req.encode()?;
        writen_deadline(&sock, &body, deadline)?;
        let answer = Answer::recv(&sock, deadline)?;
        // `sock` drops here, closing the control connection now that the fds are in hand.
        Ok(ClientConn {
            user_fds: answer.user_fds,
            exit_fd: answer.exit_fd,
        })
    }

    /// The raw fd at `index` of the answer's user descriptors (conventionally stdin=0,
    /// stdout=1, stderr=2), or `None` if that slot was absent or out of range.
    pub fn user_fd(&self, index: usize) -> Option<RawFd> {
        self.user_fds
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|fd| fd.as_raw_fd())
    }

    pub fn stdin(&self) -> Option<RawFd> {
        self.user_fd(0)
    }

    pub fn stdout(&self) -> Option<RawFd> {
        self.user_fd(1)
    }

    pub fn stderr(&self) -> Option<RawFd> {
        self.user_fd(2)
    }

    pub fn user_fd_count(&self) -> usize {
        self.user_fds.len()
    }

    /// Takes ownership of the descriptor at `index`, leaving its slot absent. Used to hand a
    /// descriptor off to another owner (e.g. a spawned child's stdio, or a splice).
    pub fn take_user_fd(&mut self, index: usize) -> Option<OwnedFd> {
        self.user_fds.get_mut(index).and_then(|slot| slot.take())
    }

    /// Takes ownership of the exit fd, for a splice that wants to forward it unread to another
    /// connection's answer (spec.md §4.7 "sconn_splice").
    pub fn take_exit_fd(&mut self) -> Option<OwnedFd> {
        self.exit_fd.take()
    }

    /// Waits for the server to close the exit fd, classifying the outcome (spec.md §4.4): `Ok`
    /// with the record if one was written, `Hup` if the server closed without writing one,
    /// `Timeout` if `deadline` passed first, `BadFd` if the exit fd was already consumed.
    pub fn wait(&mut self, deadline: Deadline) -> Result<(WaitOutcome, Option<ExitRecord>)> {
        let fd = match self.exit_fd.take() {
            Some(fd) => fd,
            None => return Ok((WaitOutcome::BadFd, None)),
        };
        match poll_status(&fd, libc::POLLIN, deadline) {
            Ok(_) => match ExitRecord::read_deadline(&fd, deadline) {
                Ok(rec) => Ok((WaitOutcome::Ok, Some(rec))),
                Err(Error::RussBase(russ_base::Error::ShortIo { got: 0, .. })) => {
                    Ok((WaitOutcome::Hup, None))
                }
                Err(e) => Err(e),
            },
            Err(russ_base::Error::DeadlineExpired) => Ok((WaitOutcome::Timeout, None)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use russ_base::deadline::NEVER;

    use super::*;
    use crate::connection::answer::Answer as WireAnswer;

    #[test]
    fn dial_collects_the_servers_answer() {
        let dir = tempfile::tempdir().unwrap();
        let saddr = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&saddr).unwrap();

        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            russ_base::fd::readn_deadline(&sock, &mut len_buf, NEVER).unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            russ_base::fd::readn_deadline(&sock, &mut body, NEVER).unwrap();
            let req = Request::decode(&body).unwrap();
            assert_eq!(req.spath, "/echo");

            let mut answer = WireAnswer::new();
            answer.exit_fd = Some({
                let mut fds = [-1; 2];
                unsafe { libc::pipe(fds.as_mut_ptr()) };
                // SAFETY: just created by a successful pipe(2) call.
                let (read, write) =
                    unsafe { (std::os::fd::FromRawFd::from_raw_fd(fds[0]), std::os::fd::FromRawFd::from_raw_fd(fds[1])) };
                let _write: OwnedFd = write;
                ExitRecord::success()
                    .write_deadline(&_write, NEVER)
                    .unwrap();
                read
            });
            answer.send(&sock, NEVER).unwrap();
        });

        let req = Request::new("execute", "/echo");
        let mut conn = ClientConn::dial(&saddr, &req, NEVER).unwrap();
        let (outcome, record) = conn.wait(NEVER).unwrap();
        assert_eq!(outcome, WaitOutcome::Ok);
        assert_eq!(record.unwrap(), ExitRecord::success());
        server.join().unwrap();
    }
}
