//! Crate-wide error type for the RUSS protocol layer.

use std::io;

/// Errors produced while encoding, decoding, resolving, dialing, or serving over RUSS.
#[remain::sorted]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `opnum == NotSet`, or an operation string the dispatcher does not recognize (spec.md
    /// §4.5 step 1).
    #[error("bad op: {0:?}")]
    BadOp(String),
    /// A non-absolute service path was presented to the dispatcher (spec.md §4.5 step 2).
    #[error("service path is not absolute: {0:?}")]
    BadSpath(String),
    /// `svcnode_add` was called with a name that already names a child of the parent.
    #[error("service node {0:?} already has a child named {1:?}")]
    DuplicateServiceName(String, String),
    /// A decoded field, or an in-memory value about to be encoded, violates a hard limit from
    /// spec.md (`1024` attrs/args, `65536`-byte spath, `262144`-byte request body).
    #[error("{what} exceeds its limit: {got} > {limit}")]
    LimitExceeded {
        what: &'static str,
        got: usize,
        limit: usize,
    },
    /// A handler returned without calling `exit` and no dispatcher fallback applied (spec.md
    /// §4.5 step 7, §7 "no-exit").
    #[error("handler did not exit")]
    NoExit,
    /// Root attempted a dial/connect and `allowrootuser` is false, or the user switch otherwise
    /// fails policy (spec.md §4.5 step 5, §8 "Autoswitchuser").
    #[error("bad user: {0}")]
    PolicyDenied(String),
    /// A request's protocol string was not exactly `"0010\0"`.
    #[error("unsupported protocol string {0:?}")]
    ProtocolMismatch(String),
    /// An error from the OS-primitives layer (`russ-base`), e.g. a deadline expiry, short I/O,
    /// or fd-passing failure.
    #[error(transparent)]
    RussBase(#[from] russ_base::Error),
    /// A service path did not resolve to a socket boundary: no component along the walk was a
    /// Unix socket, or an intermediate component was neither a directory nor a symlink.
    #[error("service path does not resolve to a socket: {0}")]
    SpathNoSocket(String),
    /// A `++`-prefixed service path could not resolve the named user's home directory.
    #[error("cannot resolve home directory for spath: {0}")]
    SpathNoUser(String),
    /// Symlink expansion did not reach a fixed point within the bound (spec.md §4.3: 32 follows).
    #[error("symlink expansion exceeded {0} hops, possible cycle")]
    SymlinkLoop(usize),
    /// Plain OS error not otherwise classified.
    #[error("OS error: {0}")]
    Sys(#[from] io::Error),
    /// Decoding ran out of bytes, or a length-prefixed field's declared length did not fit the
    /// remaining buffer.
    #[error("truncated wire data: wanted {wanted} bytes, had {have}")]
    Truncated { wanted: usize, have: usize },
    /// A byte string that was supposed to carry a NUL-terminated UTF-8 string did not decode as
    /// valid UTF-8.
    #[error("invalid UTF-8 in wire string: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, Error>;
