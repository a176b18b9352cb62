//! OS primitives that both the RUSS client and server link against, with no knowledge of the
//! wire protocol itself: deadlines, descriptor ownership, deadline-aware blocking I/O,
//! ancillary-data fd passing, peer credentials, process fork/wait, and socket announce.
//!
//! Analogous to crosvm's `base` crate: a leaf crate of OS glue that the protocol crate (`russ`)
//! builds on.

pub mod ancillary;
pub mod creds;
pub mod deadline;
pub mod error;
pub mod fd;
pub mod logging;
pub mod process;
pub mod socket;
pub mod user;

pub use creds::Creds;
pub use deadline::Deadline;
pub use error::Error;
pub use error::Result;
