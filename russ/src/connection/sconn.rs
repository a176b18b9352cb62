//! Server-side connection: the accepted control socket, the peer's kernel-verified credentials,
//! and the descriptors accumulated for the eventual answer (spec.md §3 "Connection object —
//! server view", §4.5).

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use russ_base::creds::peer_creds;
use russ_base::creds::Creds;
use russ_base::deadline::Deadline;
use russ_base::fd::readn_deadline;

use crate::codec::MAX_REQUEST_BODY;
use crate::connection::answer::Answer;
use crate::error::Error;
use crate::error::Result;
use crate::wire::Request;

/// An accepted control connection, not yet answered: "until `answer` is invoked, no descriptors
/// exist in the arrays" (spec.md §3).
pub struct ServerConn {
    sock: UnixStream,
    creds: Creds,
    user_fds: Vec<Option<OwnedFd>>,
}

impl ServerConn {
    /// Wraps a freshly accepted socket, reading the peer's credentials immediately.
    pub fn accept(sock: UnixStream) -> Result<ServerConn> {
        let creds = peer_creds(&sock)?;
        Ok(ServerConn {
            sock,
            creds,
            user_fds: Vec::new(),
        })
    }

    pub fn creds(&self) -> Creds {
        self.creds
    }

    /// Reads the fixed-size `total_body_size` prefix then exactly that many body bytes, and
    /// decodes the request (spec.md §4.1, §6 "Wire: request").
    pub fn await_request(&self, deadline: Deadline) -> Result<Request> {
        let mut len_buf = [0u8; 4];
        readn_deadline(&self.sock, &mut len_buf, deadline)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_REQUEST_BODY {
            return Err(Error::LimitExceeded {
                what: "request body",
                got: len,
                limit: MAX_REQUEST_BODY,
            });
        }
        let mut body = vec![0u8; len];
        readn_deadline(&self.sock, &mut body, deadline)?;
        Request::decode(&body)
    }

    /// Stores `fd` at `index` of the user-descriptor array that will be sent with the next
    /// [`Self::answer`], growing the array with absent slots as needed.
    pub fn set_user_fd(&mut self, index: usize, fd: OwnedFd) {
        if self.user_fds.len() <= index {
            self.user_fds.resize_with(index + 1, || None);
        }
        self.user_fds[index] = Some(fd);
    }

    /// Sends the accumulated user descriptors plus `exit_fd` (the reader end of a fresh exit
    /// pipe) back over the control socket, per the answer wire form (spec.md §6 "Wire: answer").
    /// The caller keeps `exit_fd`'s sibling writer end to send the eventual exit record.
    pub fn answer(&mut self, exit_fd: OwnedFd, deadline: Deadline) -> Result<()> {
        let mut wire = Answer::new();
        wire.user_fds = std::mem::take(&mut self.user_fds);
        wire.exit_fd = Some(exit_fd);
        wire.send(&self.sock, deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::FromRawFd;

    use russ_base::deadline::NEVER;

    use super::*;

    #[test]
    fn await_request_decodes_what_send_request_writes() {
        let (client, server) = UnixStream::pair().unwrap();
        let req = Request::new("execute", "/echo");
        let body = req.encode().unwrap();
        russ_base::fd::writen_deadline(&client, &body, NEVER).unwrap();

        let sconn = ServerConn::accept(server).unwrap();
        let decoded = sconn.await_request(NEVER).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn answer_sends_accumulated_user_fds_and_exit_fd() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut sconn = ServerConn::accept(server).unwrap();

        let mut fds = [-1; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        // SAFETY: just created by a successful pipe(2) call.
        let (exit_read, exit_write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let mut stdin_fds = [-1; 2];
        unsafe { libc::pipe(stdin_fds.as_mut_ptr()) };
        // SAFETY: just created by a successful pipe(2) call.
        let stdin_read = unsafe { OwnedFd::from_raw_fd(stdin_fds[0]) };
        sconn.set_user_fd(0, stdin_read);
        sconn.answer(exit_read, NEVER).unwrap();
        drop(exit_write);

        let received = Answer::recv(&client, NEVER).unwrap();
        assert!(received.user_fds[0].is_some());
        assert!(received.exit_fd.is_some());
    }
}
