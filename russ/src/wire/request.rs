//! Request records: the message a client sends immediately after connecting (spec.md §3, §4.1,
//! §6 "Wire: request").

use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::codec::MAX_REQUEST_BODY;
use crate::error::Error;
use crate::error::Result;
use crate::wire::sarray::SArray;

/// The only protocol string this implementation speaks or accepts.
pub const PROTOCOL_STRING: &str = "0010";

/// An attribute vector: `name=value` pairs carried alongside a request (e.g. `--perf`).
pub type AttrList = SArray;

/// An argument vector: positional strings carried alongside a request.
pub type ArgList = SArray;

/// The closed set of operations a request may name (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpNum {
    NotSet,
    Extension,
    Execute,
    Help,
    Id,
    Info,
    List,
}

impl OpNum {
    /// Maps an operation string to its opnum, the way the dispatcher classifies `req.op`. An
    /// unrecognized string maps to [`OpNum::NotSet`], which the dispatcher rejects with
    /// "bad op" (spec.md §4.5 step 1).
    pub fn from_op_str(op: &str) -> OpNum {
        match op {
            "execute" => OpNum::Execute,
            "help" => OpNum::Help,
            "id" => OpNum::Id,
            "info" => OpNum::Info,
            "list" => OpNum::List,
            _ => OpNum::NotSet,
        }
    }

    pub fn as_op_str(self) -> &'static str {
        match self {
            OpNum::NotSet => "",
            OpNum::Extension => "extension",
            OpNum::Execute => "execute",
            OpNum::Help => "help",
            OpNum::Id => "id",
            OpNum::Info => "info",
            OpNum::List => "list",
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OpNum::NotSet => 0,
            OpNum::Extension => 1,
            OpNum::Execute => 2,
            OpNum::Help => 3,
            OpNum::Id => 4,
            OpNum::Info => 5,
            OpNum::List => 6,
        }
    }
}

/// A dial request: the service path being dialed, the operation requested on it, and an
/// attribute/argument vector the handler may interpret however it likes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: String,
    pub spath: String,
    pub attrs: AttrList,
    pub args: ArgList,
}

impl Request {
    pub fn new(op: impl Into<String>, spath: impl Into<String>) -> Request {
        Request {
            op: op.into(),
            spath: spath.into(),
            attrs: AttrList::new(),
            args: ArgList::new(),
        }
    }

    /// The operation number derived from [`Self::op`]; not itself carried on the wire (spec.md
    /// §6 lists no opnum field — it is recomputed by the receiver from the operation string).
    pub fn opnum(&self) -> OpNum {
        OpNum::from_op_str(&self.op)
    }

    /// Encodes this request as `u32 total_body_size | string proto | bytes dummy | string spath
    /// | string op | sarray0 attrs | sarray0 args`, patching `total_body_size` once the rest is
    /// known.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.put_u32(0); // placeholder, patched below
        let body_start = enc.len();

        enc.put_string(PROTOCOL_STRING)?;
        enc.put_bytestring(&[])?; // reserved dummy slot, spec.md §9
        enc.put_string(&self.spath)?;
        enc.put_string(&self.op)?;
        enc.put_sarray0(&self.attrs.0)?;
        enc.put_sarray0(&self.args.0)?;

        let body_len = enc.len() - body_start;
        if body_len > MAX_REQUEST_BODY {
            return Err(Error::LimitExceeded {
                what: "request body",
                got: body_len,
                limit: MAX_REQUEST_BODY,
            });
        }
        enc.patch_u32(0, body_len as u32);
        Ok(enc.into_bytes())
    }

    /// Decodes a request from its body (the bytes that follow the 4-byte `total_body_size`
    /// prefix; see [`crate::connection::sconn::await_request`] for reading that prefix off the
    /// wire).
    pub fn decode(body: &[u8]) -> Result<Request> {
        if body.len() > MAX_REQUEST_BODY {
            return Err(Error::LimitExceeded {
                what: "request body",
                got: body.len(),
                limit: MAX_REQUEST_BODY,
            });
        }
        let mut dec = Decoder::new(body);
        let proto = dec.get_string()?;
        if proto != PROTOCOL_STRING {
            return Err(Error::ProtocolMismatch(proto));
        }
        let _dummy = dec.get_bytestring()?;
        let spath = dec.get_string()?;
        let op = dec.get_string()?;
        let attrs = AttrList::from_vec(dec.get_sarray0()?);
        let args = ArgList::from_vec(dec.get_sarray0()?);
        Ok(Request {
            op,
            spath,
            attrs,
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_every_field() {
        let mut req = Request::new("execute", "/echo");
        req.attrs.append("--perf".into());
        req.args.append("foo".into());
        req.args.append("bar".into());

        let encoded = req.encode().unwrap();
        // First 4 bytes are the body length, not part of the decoded body.
        let decoded = Request::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn encoded_length_prefix_is_exact() {
        let req = Request::new("list", "/");
        let encoded = req.encode().unwrap();
        let declared = u32::from_le_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, encoded.len() - 4);
    }

    #[test]
    fn wrong_protocol_string_fails_to_decode() {
        let mut enc = Encoder::new();
        enc.put_string("9999").unwrap();
        enc.put_bytestring(&[]).unwrap();
        enc.put_string("/x").unwrap();
        enc.put_string("execute").unwrap();
        enc.put_sarray0(&[]).unwrap();
        enc.put_sarray0(&[]).unwrap();
        let body = enc.into_bytes();
        assert!(matches!(
            Request::decode(&body),
            Err(Error::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn opnum_classifies_known_ops() {
        assert_eq!(OpNum::from_op_str("execute"), OpNum::Execute);
        assert_eq!(OpNum::from_op_str("bogus"), OpNum::NotSet);
        assert_eq!(OpNum::Execute.as_i32(), 2);
    }
}
