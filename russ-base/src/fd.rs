//! Deadline-aware blocking read/write on raw descriptors.

use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::error::Result;

fn poll_one(fd: RawFd, events: libc::c_short, deadline: Deadline) -> Result<()> {
    loop {
        let timeout_ms = if deadline.is_never() {
            -1
        } else {
            deadline.remaining_ms().clamp(0, i32::MAX as i64) as i32
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pfd` is a single, stack-owned pollfd and `poll` only writes to `revents`.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Sys(err));
        }
        if ret == 0 {
            return Err(Error::DeadlineExpired);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(Error::Sys(std::io::Error::from_raw_os_error(libc::EIO)));
        }
        return Ok(());
    }
}

/// Reads exactly `buf.len()` bytes from `fd`, blocking (subject to `deadline`) as needed.
///
/// Returns `Err(Error::ShortIo)` on EOF before `buf` is filled, and
/// `Err(Error::DeadlineExpired)` if `deadline` passes first.
pub fn readn_deadline<F: AsRawFd>(f: &F, buf: &mut [u8], deadline: Deadline) -> Result<()> {
    let fd = f.as_raw_fd();
    let mut off = 0;
    while off < buf.len() {
        poll_one(fd, libc::POLLIN, deadline)?;
        // SAFETY: `buf[off..]` is a valid, exclusively-borrowed byte slice of the requested
        // length, and `read` cannot write past `len`.
        let ret = unsafe {
            libc::read(
                fd,
                buf[off..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - off,
            )
        };
        match ret {
            0 => {
                return Err(Error::ShortIo {
                    wanted: buf.len(),
                    got: off,
                })
            }
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Sys(err));
            }
            n => off += n as usize,
        }
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes to `fd`, blocking (subject to `deadline`) as needed.
pub fn writen_deadline<F: AsRawFd>(f: &F, buf: &[u8], deadline: Deadline) -> Result<()> {
    let fd = f.as_raw_fd();
    let mut off = 0;
    while off < buf.len() {
        poll_one(fd, libc::POLLOUT, deadline)?;
        // SAFETY: `buf[off..]` is a valid byte slice of the requested length and `write` only
        // reads from it.
        let ret = unsafe {
            libc::write(
                fd,
                buf[off..].as_ptr() as *const libc::c_void,
                buf.len() - off,
            )
        };
        match ret {
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Sys(err));
            }
            n => off += n as usize,
        }
    }
    Ok(())
}

/// Like [`readn_deadline`] but stops at the first `\n` (inclusive) or `max` bytes, whichever
/// comes first. Kept for parity with `russ_readline`; no part of the core wire protocol uses
/// line framing, but front-ends speaking textual sub-protocols over a dialed connection do.
pub fn read_line_deadline<F: AsRawFd>(
    f: &F,
    max: usize,
    deadline: Deadline,
) -> Result<Vec<u8>> {
    let fd = f.as_raw_fd();
    let mut line = Vec::new();
    while line.len() < max {
        poll_one(fd, libc::POLLIN, deadline)?;
        let mut byte = [0u8; 1];
        // SAFETY: `byte` is a one-element stack buffer and `read` is asked for exactly one byte.
        let ret = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        match ret {
            0 => break,
            n if n < 0 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Sys(err));
            }
            _ => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
        }
    }
    Ok(line)
}

/// Blocks (subject to `deadline`) until `fd` is readable, writable, or has hung up, returning
/// the observed `revents`. Used by callers (e.g. the client's exit-status wait) that need to
/// distinguish hang-up from data-ready without performing the I/O themselves.
pub fn poll_status<F: AsRawFd>(f: &F, events: libc::c_short, deadline: Deadline) -> Result<i16> {
    let fd = f.as_raw_fd();
    let timeout_ms = if deadline.is_never() {
        -1
    } else {
        deadline.remaining_ms().clamp(0, i32::MAX as i64) as i32
    };
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: events | libc::POLLHUP,
            revents: 0,
        };
        // SAFETY: `pfd` is a single stack-owned pollfd; `poll` only writes to `revents`.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Sys(err));
        }
        if ret == 0 {
            return Err(Error::DeadlineExpired);
        }
        return Ok(pfd.revents);
    }
}
