//! Exit records: the status/message pair a server writes to a client's exit fd and closes
//! (spec.md §3, §4.4, §6 "Wire: exit").

use std::os::fd::AsRawFd;

use russ_base::deadline::Deadline;
use russ_base::fd::readn_deadline;
use russ_base::fd::writen_deadline;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::codec::MAX_STRING_LEN;
use crate::error::Error;
use crate::error::Result;

/// The fixed-width piece of an exit record's wire form: a little-endian `i32` status, sent ahead
/// of the variable-length message. A faithful derive fit (spec.md §3), unlike the sarray0/sarrayn
/// bodies the hand-rolled [`Encoder`]/[`Decoder`] cover elsewhere.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct StatusWire {
    status: zerocopy::byteorder::I32<zerocopy::byteorder::LittleEndian>,
}

/// The fixed-width length prefix ahead of an exit record's message bytes.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
struct MessageLenWire {
    len: zerocopy::byteorder::I32<zerocopy::byteorder::LittleEndian>,
}

/// Conventional exit statuses (spec.md §3).
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FD_CLOSED: i32 = 125;
pub const EXIT_CALL_FAILURE: i32 = 126;
pub const EXIT_SYSTEM_FAILURE: i32 = 127;

/// A 32-bit signed status plus a human-readable message, written to the exit fd (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub status: i32,
    pub message: String,
}

impl ExitRecord {
    pub fn new(status: i32, message: impl Into<String>) -> ExitRecord {
        ExitRecord {
            status,
            message: message.into(),
        }
    }

    pub fn success() -> ExitRecord {
        ExitRecord::new(EXIT_SUCCESS, "")
    }

    pub fn failure(message: impl Into<String>) -> ExitRecord {
        ExitRecord::new(EXIT_FAILURE, message)
    }

    pub fn system_failure(message: impl Into<String>) -> ExitRecord {
        ExitRecord::new(EXIT_SYSTEM_FAILURE, message)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.put_i32(self.status);
        enc.put_string(&self.message)?;
        Ok(enc.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<ExitRecord> {
        let mut dec = Decoder::new(bytes);
        let status = dec.get_i32()?;
        let message = dec.get_string()?;
        Ok(ExitRecord { status, message })
    }

    /// Writes this record directly to `fd` (the writer end of the exit pipe), subject to
    /// `deadline`. The caller is responsible for closing `fd` afterwards, which is what signals
    /// "done" to the reader (spec.md §4.4).
    pub fn write_deadline<F: AsRawFd>(&self, fd: &F, deadline: Deadline) -> Result<()> {
        let mut status_wire = StatusWire::new_zeroed();
        status_wire.status.set(self.status);
        writen_deadline(fd, status_wire.as_bytes(), deadline)?;

        let mut message_bytes = self.message.clone().into_bytes();
        message_bytes.push(0);
        let mut len_wire = MessageLenWire::new_zeroed();
        len_wire.len.set(i32::try_from(message_bytes.len()).unwrap_or(i32::MAX));
        writen_deadline(fd, len_wire.as_bytes(), deadline)?;
        writen_deadline(fd, &message_bytes, deadline)?;
        Ok(())
    }

    /// Reads a record directly from `fd` (the reader end of the exit pipe): a 4-byte status, a
    /// 4-byte message length, then the message bytes.
    pub fn read_deadline<F: AsRawFd>(fd: &F, deadline: Deadline) -> Result<ExitRecord> {
        let mut status_wire = StatusWire::new_zeroed();
        readn_deadline(fd, status_wire.as_bytes_mut(), deadline)?;
        let status = status_wire.status.get();

        let mut len_wire = MessageLenWire::new_zeroed();
        readn_deadline(fd, len_wire.as_bytes_mut(), deadline)?;
        let len = len_wire.len.get();
        let len = usize::try_from(len).unwrap_or(0);
        if len > MAX_STRING_LEN {
            return Err(Error::LimitExceeded {
                what: "exit record message",
                got: len,
                limit: MAX_STRING_LEN,
            });
        }

        let mut msg_buf = vec![0u8; len];
        readn_deadline(fd, &mut msg_buf, deadline)?;
        if msg_buf.last() == Some(&0) {
            msg_buf.pop();
        }
        let message = String::from_utf8(msg_buf).map_err(|e| e.utf8_error())?;
        Ok(ExitRecord { status, message })
    }
}

/// The outcome of waiting on a client's exit fd (spec.md §4.4). Unlike [`ExitRecord`] this is
/// never itself encoded on the wire; it classifies what the *read* observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An [`ExitRecord`] was read successfully.
    Ok,
    /// The exit fd slot was already closed (sentinel) when the wait began.
    BadFd,
    /// The deadline passed before the exit fd became readable.
    Timeout,
    /// The exit fd hung up without any payload (the server dropped the writer without sending a
    /// record).
    Hup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_record_round_trips() {
        let rec = ExitRecord::new(7, "exited with code 7");
        let encoded = rec.encode().unwrap();
        let decoded = ExitRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn success_has_zero_status_and_empty_message() {
        let rec = ExitRecord::success();
        assert_eq!(rec.status, EXIT_SUCCESS);
        assert!(rec.message.is_empty());
    }

    #[test]
    fn write_then_read_over_a_pipe_round_trips() {
        use std::os::fd::FromRawFd;
        use std::os::fd::OwnedFd;

        let mut fds = [-1; 2];
        // SAFETY: `fds` is a 2-element stack array and `pipe` only writes into it.
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        // SAFETY: both fds were just created by a successful `pipe(2)` call.
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let rec = ExitRecord::new(125, "exit-fd-closed");
        rec.write_deadline(&tx, russ_base::deadline::NEVER).unwrap();
        drop(tx);

        let read_back = ExitRecord::read_deadline(&rx, russ_base::deadline::NEVER).unwrap();
        assert_eq!(read_back, rec);
    }
}
