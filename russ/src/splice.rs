//! Transferring an inner dial's descriptors onward through a server connection, optionally
//! preceded by a user switch and the dial itself (spec.md §4.7).

use std::path::Path;

use russ_base::deadline::Deadline;

use crate::connection::cconn::ClientConn;
use crate::error::Result;
use crate::server::Session;
use crate::wire::Request;

/// Transfers `inner`'s user descriptors into `session` and forwards its exit fd unread, then
/// sends the answer. After this returns, `session`'s handler can return immediately: the
/// process need not participate in the ensuing byte traffic, since the transferred descriptors
/// connect the original dialer directly to whatever served `inner` (spec.md §4.7
/// "sconn_splice").
pub fn splice(session: &mut Session, mut inner: ClientConn) -> Result<()> {
    for index in 0..inner.user_fd_count() {
        if let Some(fd) = inner.take_user_fd(index) {
            session.set_user_fd(index, fd);
        }
    }
    match inner.take_exit_fd() {
        Some(exit_fd) => session.answer_with_exit_fd(exit_fd),
        None => session.answer(),
    }
}

/// Dials `spath` at `saddr` and splices the result into `session`, composing a user switch, an
/// outbound dial, and [`splice`] into a single "become a transparent router" call (spec.md §4.7
/// "sconn_redialandsplice"). Any failure along the way — user switch, dial, or splice — is
/// reported to `session` as a fatal exit record rather than propagated, matching the C
/// original's "teardown the local connection on any failure" contract.
pub fn redial_and_splice(
    session: &mut Session,
    saddr: &Path,
    req: &Request,
    switch_to: Option<(libc::uid_t, libc::gid_t)>,
    deadline: Deadline,
) -> Result<()> {
    if let Some((uid, gid)) = switch_to {
        if let Err(e) = russ_base::user::switch_user(uid, gid, None) {
            return session.fatal(format!("cannot switch user: {e}"));
        }
    }

    let inner = match ClientConn::dial(saddr, req, deadline) {
        Ok(conn) => conn,
        Err(e) => return session.fatal(format!("redial failed: {e}")),
    };

    if let Err(e) = splice(session, inner) {
        return session.fatal(format!("splice failed: {e}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::fd::FromRawFd;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixListener;
    use std::os::unix::net::UnixStream;

    use russ_base::deadline::NEVER;

    use super::*;
    use crate::connection::answer::Answer;
    use crate::connection::sconn::ServerConn;
    use crate::wire::ExitRecord;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [-1; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        // SAFETY: both fds were just created by a successful pipe(2) call.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn splice_forwards_fds_and_exit_fd_to_the_outer_client() {
        // Back-end server: answers any dial with one pipe fd and an exit fd it immediately
        // writes "success" to.
        let dir = tempfile::tempdir().unwrap();
        let back_addr = dir.path().join("back.sock");
        let back_listener = UnixListener::bind(&back_addr).unwrap();
        let backend = std::thread::spawn(move || {
            let (sock, _) = back_listener.accept().unwrap();
            let sconn = ServerConn::accept(sock).unwrap();
            let _req = sconn.await_request(NEVER).unwrap();
            let (stdout_read, stdout_write) = pipe();
            russ_base::fd::writen_deadline(&stdout_write, b"from backend", NEVER).unwrap();
            drop(stdout_write);

            let mut sconn = sconn;
            sconn.set_user_fd(1, stdout_read);
            let (exit_read, exit_write) = pipe();
            sconn.answer(exit_read, NEVER).unwrap();
            ExitRecord::success().write_deadline(&exit_write, NEVER).unwrap();
        });

        // Front server: receives a dial, redials the backend, and splices it straight through.
        let (front_client, front_server) = UnixStream::pair().unwrap();
        let front_sconn = ServerConn::accept(front_server).unwrap();
        let front_req = Request::new("execute", "/front");
        let body = front_req.encode().unwrap();
        russ_base::fd::writen_deadline(&front_client, &body, NEVER).unwrap();
        let decoded = front_sconn.await_request(NEVER).unwrap();

        let mut session = crate::server::Session::for_test(front_sconn, decoded);

        let inner_req = Request::new("execute", "/back");
        redial_and_splice(&mut session, &back_addr, &inner_req, None, NEVER).unwrap();

        let answer = Answer::recv(&front_client, NEVER).unwrap();
        assert!(answer.user_fds[1].is_some());
        let exit_fd = answer.exit_fd.unwrap();
        let record = ExitRecord::read_deadline(&exit_fd, NEVER).unwrap();
        assert_eq!(record, ExitRecord::success());

        let out_fd = answer.user_fds[1].as_ref().unwrap().as_raw_fd();
        let mut buf = [0u8; 64];
        // SAFETY: `buf` is a correctly-sized stack buffer.
        let n = unsafe { libc::read(out_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(&buf[..n as usize], b"from backend");

        backend.join().unwrap();
    }
}
