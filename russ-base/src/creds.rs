//! Peer credentials of a connected Unix-domain socket, as delivered by the kernel
//! (`SO_PEERCRED` on Linux) rather than anything asserted by the peer itself.

use std::os::fd::AsRawFd;

use cfg_if::cfg_if;

use crate::error::Error;
use crate::error::Result;

pub type Uid = libc::uid_t;
pub type Gid = libc::gid_t;
pub type Pid = libc::pid_t;

/// The identity of the process on the other end of a connected Unix-domain socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Creds {
    pub pid: Pid,
    pub uid: Uid,
    pub gid: Gid,
}

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Reads the kernel-verified credentials of the peer connected to `sock`.
        pub fn peer_creds<S: AsRawFd>(sock: &S) -> Result<Creds> {
            let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
            // SAFETY: `ucred` and `len` are valid, exclusively-owned stack locations matching
            // the size the kernel expects for `SO_PEERCRED`, and the return value is checked.
            let ret = unsafe {
                libc::getsockopt(
                    sock.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_PEERCRED,
                    &mut ucred as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if ret != 0 {
                return Err(Error::UnknownPeerCreds(std::io::Error::last_os_error()));
            }
            Ok(Creds {
                pid: ucred.pid,
                uid: ucred.uid,
                gid: ucred.gid,
            })
        }
    } else {
        /// Reads the kernel-verified credentials of the peer connected to `sock`.
        pub fn peer_creds<S: AsRawFd>(sock: &S) -> Result<Creds> {
            let mut uid: Uid = 0;
            let mut gid: Gid = 0;
            // SAFETY: `uid`/`gid` are valid, exclusively-owned stack locations and the return
            // value is checked. BSD/macOS have no `getpeereid` equivalent for the pid, so `pid`
            // is reported as 0 on these platforms.
            let ret = unsafe { libc::getpeereid(sock.as_raw_fd(), &mut uid, &mut gid) };
            if ret != 0 {
                return Err(Error::UnknownPeerCreds(std::io::Error::last_os_error()));
            }
            Ok(Creds { pid: 0, uid, gid })
        }
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn peer_creds_reports_this_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = peer_creds(&a).unwrap();
        // SAFETY: trivially safe, getuid/getgid/getpid never fail.
        unsafe {
            assert_eq!(creds.uid, libc::getuid());
            assert_eq!(creds.gid, libc::getgid());
            assert_eq!(creds.pid, libc::getpid());
        }
    }
}
