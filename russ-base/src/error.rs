use std::io;

/// Errors produced by the OS primitives in this crate.
#[remain::sorted]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A blocking operation did not complete before its deadline.
    #[error("deadline expired")]
    DeadlineExpired,
    /// `recvmsg`/`sendmsg` on a control socket did not carry the expected ancillary data.
    #[error("no file descriptor in ancillary data")]
    NoFdInAncillary,
    /// The peer closed its end of the connection.
    #[error("peer closed the connection")]
    PeerClosed,
    /// A read or write returned fewer bytes than requested without signaling EOF or deadline
    /// expiry; this should only happen for non-blocking descriptors used incorrectly.
    #[error("short I/O: wanted {wanted} bytes, got {got}")]
    ShortIo { wanted: usize, got: usize },
    /// Wraps a plain OS error (`errno`) not covered by a more specific variant.
    #[error("OS error: {0}")]
    Sys(#[from] io::Error),
    /// Could not resolve the credentials of a connected peer.
    #[error("failed to read peer credentials: {0}")]
    UnknownPeerCreds(io::Error),
    /// `setresuid`/`setresgid`/`initgroups` failed while switching to another user.
    #[error("failed to switch user: {0}")]
    UserSwitch(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
