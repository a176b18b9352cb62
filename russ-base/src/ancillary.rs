//! Passing a single open file descriptor over a Unix stream socket via `SCM_RIGHTS`.
//!
//! Stable Rust has no safe API for ancillary data (`std::os::unix::net::SocketAncillary` is
//! nightly-only), so this goes straight to `libc::sendmsg`/`recvmsg` and the `CMSG_*` macros,
//! the same approach used for ordinary vhost-user descriptor transfer.

use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use crate::error::Error;
use crate::error::Result;

/// Sends a single dummy byte plus `fd` as `SCM_RIGHTS` ancillary data over `sock`.
///
/// The caller retains ownership of `fd`; the kernel duplicates the descriptor into the peer's
/// table, so the caller is responsible for closing its own copy afterwards if it no longer
/// needs it (mirrors `russ_sendfd`: the connection layer above this always does so).
pub fn send_fd<S: AsRawFd>(sock: &S, fd: RawFd) -> Result<()> {
    let dummy = [0u8];
    let mut iov = libc::iovec {
        iov_base: dummy.as_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };

    // SAFETY: computes a constant from a constant-sized type; does not touch memory.
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: `msg` was just initialized above with a valid `msg_control`/`msg_controllen` pair.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(Error::Sys(std::io::Error::from_raw_os_error(libc::EINVAL)));
    }
    // SAFETY: `cmsg` is non-null and was sized by `CMSG_SPACE` to hold exactly one `RawFd`.
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::copy_nonoverlapping(&fd as *const RawFd, libc::CMSG_DATA(cmsg) as *mut RawFd, 1);
    }

    // SAFETY: `msg` points only at stack/heap memory owned by this function for the duration of
    // the call.
    let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(Error::Sys(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Receives one descriptor sent by [`send_fd`] over `sock`, returning it as an owned
/// descriptor.
pub fn recv_fd<S: AsRawFd>(sock: &S) -> Result<OwnedFd> {
    // SAFETY: computes a constant from a constant-sized type; does not touch memory.
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut dummy = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr() as *mut libc::c_void,
        iov_len: dummy.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: `msg` points only at stack/heap memory owned by this function for the duration of
    // the call, and the return value is checked before any control data is read.
    let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if ret < 0 {
        return Err(Error::Sys(std::io::Error::last_os_error()));
    }
    if ret == 0 {
        return Err(Error::PeerClosed);
    }

    // SAFETY: `msg` was populated by the successful `recvmsg` call above.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(Error::NoFdInAncillary);
    }
    // SAFETY: `cmsg` is non-null, so reading its header fields is in-bounds.
    let (level, ty) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
    if level != libc::SOL_SOCKET || ty != libc::SCM_RIGHTS {
        return Err(Error::NoFdInAncillary);
    }
    // SAFETY: we just verified this control message is `SCM_RIGHTS` sized for one `RawFd`, which
    // is how [`send_fd`] always constructs it.
    let fd = unsafe { *(libc::CMSG_DATA(cmsg) as *const RawFd) };
    // SAFETY: `fd` was just received as a fresh descriptor duplicated into our table by the
    // kernel; nothing else owns it yet.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
