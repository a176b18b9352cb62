//! RUSS: a Unix-domain-socket RPC substrate. A client dials a hierarchical service path and
//! receives back a bundle of file descriptors plus a separate exit channel; a server answers
//! dials against a tree of named handlers. See the module docs below for the wire format,
//! service tree, and dispatch loop.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod relay;
pub mod server;
pub mod spath;
pub mod splice;
pub mod svcnode;
pub mod wire;

pub use client::dial_and_collect;
pub use client::Collected;
pub use config::RussConfig;
pub use connection::Answer;
pub use connection::ClientConn;
pub use connection::ServerConn;
pub use connection::MAX_USER_FDS;
pub use error::Error;
pub use error::Result;
pub use relay::Direction;
pub use relay::Relay;
pub use relay::RelayStream;
pub use server::Server;
pub use server::ServerLoop;
pub use server::Session;
pub use spath::Target;
pub use splice::redial_and_splice;
pub use splice::splice;
pub use svcnode::Handler;
pub use svcnode::ServiceNode;
pub use wire::ArgList;
pub use wire::AttrList;
pub use wire::ExitRecord;
pub use wire::OpNum;
pub use wire::Request;
pub use wire::WaitOutcome;
pub use wire::PROTOCOL_STRING;
