//! Connection objects: the client and server views of a dialed control socket, and the answer
//! wire form they share (spec.md §3 "Connection object").

pub mod answer;
pub mod cconn;
pub mod sconn;

pub use answer::Answer;
pub use answer::MAX_USER_FDS;
pub use cconn::ClientConn;
pub use sconn::ServerConn;
