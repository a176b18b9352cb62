//! Multi-stream byte pump: splices several fd pairs between two processes while observing a
//! control (exit) descriptor for hang-up (spec.md §4.6).
//!
//! A [`Relay`] borrows raw descriptors rather than owning them — the caller (typically
//! [`crate::splice`]) keeps the underlying [`std::os::fd::OwnedFd`]s alive for the relay's
//! duration and closes them afterwards.

use std::os::fd::RawFd;
use std::time::Duration;

use russ_base::deadline::Deadline;

use crate::error::Error;
use crate::error::Result;

const BUFFER_CAPACITY: usize = 65536;
const POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reading,
    Writing,
}

/// Which half of a completed I/O operation a stream's callback fired for (spec.md §4.6
/// "Callback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One half-duplex byte path between `read_fd` and `write_fd`, with a single fixed-capacity
/// buffer that flip-flops between reading and writing phases (spec.md §3 "Buffer").
pub struct RelayStream {
    read_fd: RawFd,
    write_fd: RawFd,
    buf: Vec<u8>,
    offset: usize,
    phase: Phase,
    draining: bool,
    bytes_in: u64,
    bytes_out: u64,
    reads: u64,
    writes: u64,
    callback: Option<Box<dyn FnMut(&RelayStream, Direction) + Send>>,
}

impl RelayStream {
    pub fn new(read_fd: RawFd, write_fd: RawFd) -> RelayStream {
        RelayStream {
            read_fd,
            write_fd,
            buf: Vec::new(),
            offset: 0,
            phase: Phase::Reading,
            draining: false,
            bytes_in: 0,
            bytes_out: 0,
            reads: 0,
            writes: 0,
            callback: None,
        }
    }

    /// Attaches a callback fired after every completed read or write (spec.md §4.6 "Callback"),
    /// useful for tee-style capture without copying the buffer into caller code.
    pub fn with_callback(
        mut self,
        callback: impl FnMut(&RelayStream, Direction) + Send + 'static,
    ) -> RelayStream {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn poll_events(&self) -> libc::c_short {
        match self.phase {
            Phase::Reading => libc::POLLIN,
            Phase::Writing => libc::POLLOUT,
        }
    }

    fn poll_fd(&self) -> RawFd {
        match self.phase {
            Phase::Reading => self.read_fd,
            Phase::Writing => self.write_fd,
        }
    }

    /// Invokes the callback, if any, temporarily taking ownership of it so the callback can
    /// still borrow `self` immutably without aliasing `self.callback`.
    fn fire_callback(&mut self, direction: Direction) {
        if let Some(mut cb) = self.callback.take() {
            cb(self, direction);
            self.callback = Some(cb);
        }
    }

    /// Returns `true` if this stream should be removed from the relay.
    fn advance(&mut self, revents: libc::c_short) -> bool {
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return true;
        }
        match self.phase {
            Phase::Reading => {
                if revents & libc::POLLIN == 0 {
                    return revents & libc::POLLHUP != 0;
                }
                self.buf = vec![0u8; BUFFER_CAPACITY];
                // SAFETY: `self.buf` is a freshly allocated, exclusively-owned buffer of the
                // given capacity; `read` cannot write past it.
                let n = unsafe {
                    libc::read(
                        self.read_fd,
                        self.buf.as_mut_ptr() as *mut libc::c_void,
                        self.buf.len(),
                    )
                };
                if n <= 0 {
                    return true;
                }
                self.buf.truncate(n as usize);
                self.offset = 0;
                self.bytes_in += n as u64;
                self.reads += 1;
                self.phase = Phase::Writing;
                self.fire_callback(Direction::Read);
                false
            }
            Phase::Writing => {
                if revents & libc::POLLOUT == 0 {
                    return false;
                }
                let remaining = &self.buf[self.offset..];
                // SAFETY: `remaining` is a valid slice into `self.buf`; `write` only reads it.
                let n = unsafe {
                    libc::write(
                        self.write_fd,
                        remaining.as_ptr() as *const libc::c_void,
                        remaining.len(),
                    )
                };
                if n < 0 {
                    return true;
                }
                self.offset += n as usize;
                self.bytes_out += n as u64;
                if self.offset == self.buf.len() {
                    self.writes += 1;
                    self.buf.clear();
                    self.offset = 0;
                    self.phase = Phase::Reading;
                    self.fire_callback(Direction::Write);
                    return self.draining;
                }
                false
            }
        }
    }
}

/// Pumps bytes between several stream pairs until all are removed (closed, errored, or drained
/// after the watched exit fd hangs up) or `deadline` passes (spec.md §4.6).
pub struct Relay {
    streams: Vec<Option<RelayStream>>,
    exit_fd: Option<RawFd>,
    exited: bool,
}

impl Relay {
    pub fn new() -> Relay {
        Relay {
            streams: Vec::new(),
            exit_fd: None,
            exited: false,
        }
    }

    pub fn add_stream(&mut self, stream: RelayStream) {
        self.streams.push(Some(stream));
    }

    /// A bidirectional pair is simply two streams with their fds swapped (spec.md §4.6
    /// "Model"): `a_to_b` reads `a` and writes `b`; `b_to_a` reads `b` and writes `a`.
    pub fn add_bidir_pair(&mut self, a: RawFd, b: RawFd) {
        self.add_stream(RelayStream::new(a, b));
        self.add_stream(RelayStream::new(b, a));
    }

    /// The descriptor this relay watches for hang-up as the overall "done" signal (spec.md §4.6
    /// "Exit observation").
    pub fn watch_exit(&mut self, exit_fd: RawFd) {
        self.exit_fd = Some(exit_fd);
    }

    pub fn active_count(&self) -> usize {
        self.streams.iter().filter(|s| s.is_some()).count()
    }

    /// Runs until every stream has been removed or `deadline` passes.
    pub fn run(&mut self, deadline: Deadline) -> Result<()> {
        loop {
            if self.active_count() == 0 {
                return Ok(());
            }
            if deadline.has_expired() {
                return Err(Error::RussBase(russ_base::Error::DeadlineExpired));
            }

            let mut pollfds: Vec<libc::pollfd> = Vec::new();
            let mut indices: Vec<usize> = Vec::new();
            for (i, slot) in self.streams.iter().enumerate() {
                if let Some(stream) = slot {
                    pollfds.push(libc::pollfd {
                        fd: stream.poll_fd(),
                        events: stream.poll_events(),
                        revents: 0,
                    });
                    indices.push(i);
                }
            }
            let exit_index = self.exit_fd.map(|fd| {
                pollfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                pollfds.len() - 1
            });

            let timeout_ms = POLL_SLICE.as_millis() as i32;
            // SAFETY: `pollfds` is a valid, exclusively-owned buffer for the duration of the
            // call; `poll` only writes to each entry's `revents`.
            let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::RussBase(russ_base::Error::Sys(err)));
            }

            if let Some(exit_idx) = exit_index {
                if pollfds[exit_idx].revents & libc::POLLHUP != 0 {
                    self.exited = true;
                }
            }

            for (pfd, stream_idx) in pollfds.iter().zip(indices.iter().copied()) {
                if exit_index == Some(stream_idx) {
                    continue;
                }
                let remove = if let Some(stream) = self.streams[stream_idx].as_mut() {
                    if self.exited && stream.phase == Phase::Reading {
                        true
                    } else {
                        if self.exited {
                            stream.draining = true;
                        }
                        stream.advance(pfd.revents)
                    }
                } else {
                    false
                };
                if remove {
                    self.streams[stream_idx] = None;
                }
            }
        }
    }
}

impl Default for Relay {
    fn default() -> Relay {
        Relay::new()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::fd::FromRawFd;
    use std::os::fd::OwnedFd;

    use russ_base::deadline::Deadline;

    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [-1; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        // SAFETY: both fds were just created by a successful pipe(2) call.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn relay_forwards_bytes_and_stops_on_source_close() {
        let (src_read, src_write) = pipe();
        let (dst_read, dst_write) = pipe();

        let writer = std::thread::spawn(move || {
            russ_base::fd::writen_deadline(&src_write, b"hello relay", russ_base::deadline::NEVER)
                .unwrap();
            drop(src_write);
        });

        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                // SAFETY: `buf` is a correctly-sized stack buffer.
                let n = unsafe {
                    libc::read(dst_read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n as usize]);
            }
            out
        });

        let mut relay = Relay::new();
        relay.add_stream(RelayStream::new(src_read.as_raw_fd(), dst_write.as_raw_fd()));
        let deadline = Deadline::from_timeout(Some(std::time::Duration::from_secs(5)));
        relay.run(deadline).unwrap();
        drop(dst_write);
        drop(src_read);

        writer.join().unwrap();
        let received = reader.join().unwrap();
        assert_eq!(received, b"hello relay");
    }
}
