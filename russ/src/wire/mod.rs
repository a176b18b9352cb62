//! Request and exit record types built on top of [`crate::codec`].

pub mod exit;
pub mod request;
pub mod sarray;

pub use exit::ExitRecord;
pub use exit::WaitOutcome;
pub use request::ArgList;
pub use request::AttrList;
pub use request::OpNum;
pub use request::Request;
pub use request::PROTOCOL_STRING;
pub use sarray::SArray;
