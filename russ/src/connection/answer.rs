//! The answer wire form shared by client receipt, server send, and splice forwarding (spec.md
//! §3 "Connection object", §6 "Wire: answer").

use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;

use russ_base::ancillary;
use russ_base::deadline::Deadline;
use russ_base::fd::readn_deadline;
use russ_base::fd::writen_deadline;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::error::Error;
use crate::error::Result;

/// Upper bound on user descriptors a connection may carry (spec.md §3).
pub const MAX_USER_FDS: usize = 32;

/// The fixed-width descriptor-count preamble ahead of an answer's presence bytes (spec.md §3, §6
/// "Wire: answer") — a faithful derive fit, unlike the variable-length presence/fd portions that
/// follow it.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct NfdsWire {
    nfds: zerocopy::byteorder::U32<zerocopy::byteorder::LittleEndian>,
}

/// A bundle of descriptors transferred over a control socket: some number of "user" fds
/// (conventionally stdin/stdout/stderr at indices 0/1/2) followed on the wire by the single
/// "system" fd (the exit channel). Absent slots are `None`.
#[derive(Default)]
pub struct Answer {
    pub user_fds: Vec<Option<OwnedFd>>,
    pub exit_fd: Option<OwnedFd>,
}

impl Answer {
    pub fn new() -> Answer {
        Answer {
            user_fds: Vec::new(),
            exit_fd: None,
        }
    }

    fn presence(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .user_fds
            .iter()
            .map(|slot| slot.is_some() as u8)
            .collect();
        bytes.push(self.exit_fd.is_some() as u8);
        bytes
    }

    /// Writes `u32 nfds | nfds presence bytes | descriptors as ancillary data in presence order`
    /// over `sock` (spec.md §6 "Wire: answer"). Slots are sent user fds first, exit fd last.
    pub fn send(&self, sock: &UnixStream, deadline: Deadline) -> Result<()> {
        let presence = self.presence();
        let mut nfds_wire = NfdsWire::new_zeroed();
        nfds_wire.nfds.set(presence.len() as u32);
        writen_deadline(sock, nfds_wire.as_bytes(), deadline)?;
        writen_deadline(sock, &presence, deadline)?;

        for slot in &self.user_fds {
            if let Some(fd) = slot {
                ancillary::send_fd(sock, fd.as_raw_fd())?;
            }
        }
        if let Some(fd) = &self.exit_fd {
            ancillary::send_fd(sock, fd.as_raw_fd())?;
        }
        Ok(())
    }

    /// Reads an [`Answer`] as written by [`Self::send`]. The last presence slot is always the
    /// exit fd; every slot before it is a user fd.
    pub fn recv(sock: &UnixStream, deadline: Deadline) -> Result<Answer> {
        let mut nfds_wire = NfdsWire::new_zeroed();
        readn_deadline(sock, nfds_wire.as_bytes_mut(), deadline)?;
        let nfds = nfds_wire.nfds.get() as usize;
        if nfds == 0 || nfds > MAX_USER_FDS + 1 {
            return Err(Error::LimitExceeded {
                what: "answer descriptor count",
                got: nfds,
                limit: MAX_USER_FDS + 1,
            });
        }

        let mut presence = vec![0u8; nfds];
        readn_deadline(sock, &mut presence, deadline)?;

        let mut answer = Answer {
            user_fds: vec![None; nfds - 1],
            exit_fd: None,
        };
        for (i, &present) in presence.iter().enumerate() {
            if present == 0 {
                continue;
            }
            let fd = ancillary::recv_fd(sock)?;
            if i + 1 == nfds {
                answer.exit_fd = Some(fd);
            } else {
                answer.user_fds[i] = Some(fd);
            }
        }
        Ok(answer)
    }

    /// Raw fd numbers of every present user slot, in index order, for use by callers (e.g.
    /// splice) that need to hand them to another send without re-borrowing the `OwnedFd`s.
    pub fn user_fd_numbers(&self) -> Vec<Option<RawFd>> {
        self.user_fds
            .iter()
            .map(|slot| slot.as_ref().map(|fd| fd.as_raw_fd()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::FromRawFd;

    use russ_base::deadline::NEVER;

    use super::*;

    fn pipe_fd() -> OwnedFd {
        let mut fds = [-1; 2];
        // SAFETY: `fds` is a 2-element stack array and `pipe` only writes into it.
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        // SAFETY: just created by a successful `pipe(2)` call.
        unsafe { OwnedFd::from_raw_fd(fds[0]) }
    }

    #[test]
    fn answer_round_trips_over_a_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut sent = Answer::new();
        sent.user_fds = vec![Some(pipe_fd()), None, Some(pipe_fd())];
        sent.exit_fd = Some(pipe_fd());
        sent.send(&a, NEVER).unwrap();

        let received = Answer::recv(&b, NEVER).unwrap();
        assert_eq!(received.user_fds.len(), 3);
        assert!(received.user_fds[0].is_some());
        assert!(received.user_fds[1].is_none());
        assert!(received.user_fds[2].is_some());
        assert!(received.exit_fd.is_some());
    }

    #[test]
    fn all_absent_answer_still_round_trips() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sent = Answer::new();
        sent.user_fds = vec![None, None];
        sent.send(&a, NEVER).unwrap();

        let received = Answer::recv(&b, NEVER).unwrap();
        assert_eq!(received.user_fds.len(), 2);
        assert!(received.user_fds.iter().all(Option::is_none));
        assert!(received.exit_fd.is_none());
    }
}
