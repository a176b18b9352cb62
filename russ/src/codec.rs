//! Little-endian integer, length-prefixed byte-string, and string-array encoding (spec.md §4.1).
//!
//! The C implementation threads a `(cur, end)` pointer pair through every encoder/decoder and
//! returns the advanced pointer or a null sentinel on overflow. Here that becomes a cursor over
//! `&[u8]` for decoding (grounded on `vmm_vhost::connection::socket::advance_slices`, which
//! already treats buffer progress as slice reborrows rather than pointer arithmetic) and a
//! growing `Vec<u8>` for encoding, since the request's total body size is only known after the
//! rest has been encoded and is patched in afterwards.

use crate::error::Error;
use crate::error::Result;

/// Maximum length, in bytes, of a decoded byte string (covers spath's own 65536-byte cap and
/// serves as a blanket sanity limit for any other string field).
pub const MAX_STRING_LEN: usize = 65536;

/// Maximum number of entries in an attribute or argument array (spec.md §3).
pub const MAX_SARRAY_LEN: usize = 1024;

/// Maximum encoded size of a whole request body (spec.md §3).
pub const MAX_REQUEST_BODY: usize = 262144;

/// A read cursor over a decoded wire buffer.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                wanted: n,
                have: self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Decodes an `int32 length` + `length` bytes byte string, returning the raw bytes
    /// (including the trailing NUL that string fields carry).
    pub fn get_bytestring(&mut self) -> Result<Vec<u8>> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(Error::Truncated {
                wanted: 0,
                have: self.remaining(),
            });
        }
        let len = len as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::LimitExceeded {
                what: "byte string",
                got: len,
                limit: MAX_STRING_LEN,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Decodes a byte string and interprets it as a NUL-terminated UTF-8 string, stripping the
    /// terminator.
    pub fn get_string(&mut self) -> Result<String> {
        let mut bytes = self.get_bytestring()?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes).map_err(|e| e.utf8_error())?)
    }

    /// Decodes `int32 count` followed by `count` length-prefixed strings. The in-memory NUL
    /// sentinel slot that the C "sarray0" variant appends is never materialized here: a
    /// `Vec<String>` already carries its own length, so `get_sarray0` and `get_sarray` decode
    /// identically. Both are exposed so call sites can name which wire array they mean.
    pub fn get_sarray(&mut self) -> Result<Vec<String>> {
        let count = self.get_i32()?;
        if count < 0 {
            return Err(Error::Truncated {
                wanted: 0,
                have: self.remaining(),
            });
        }
        let count = count as usize;
        if count > MAX_SARRAY_LEN {
            return Err(Error::LimitExceeded {
                what: "string array",
                got: count,
                limit: MAX_SARRAY_LEN,
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.get_string()?);
        }
        Ok(items)
    }

    /// Alias for [`get_sarray`](Self::get_sarray); see its doc for why sarray0 and sarrayn share
    /// a decoder in Rust.
    pub fn get_sarray0(&mut self) -> Result<Vec<String>> {
        self.get_sarray()
    }
}

/// A write cursor that grows a `Vec<u8>`.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrites 4 already-written bytes at `at` with `v`, little-endian. Used to patch the
    /// request's `total_body_size` prefix once the rest of the body has been encoded.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytestring(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_STRING_LEN {
            return Err(Error::LimitExceeded {
                what: "byte string",
                got: bytes.len(),
                limit: MAX_STRING_LEN,
            });
        }
        self.put_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Encodes `s` as a byte string with its trailing NUL included in the length, per spec.md
    /// §4.1 ("Strings include the terminating NUL byte in the length").
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.put_bytestring(&bytes)
    }

    pub fn put_sarray(&mut self, items: &[String]) -> Result<()> {
        if items.len() > MAX_SARRAY_LEN {
            return Err(Error::LimitExceeded {
                what: "string array",
                got: items.len(),
                limit: MAX_SARRAY_LEN,
            });
        }
        self.put_i32(items.len() as i32);
        for item in items {
            self.put_string(item)?;
        }
        Ok(())
    }

    /// Alias for [`put_sarray`](Self::put_sarray); the wire encoding of sarray0 and sarrayn is
    /// identical (see [`Decoder::get_sarray0`]).
    pub fn put_sarray0(&mut self, items: &[String]) -> Result<()> {
        self.put_sarray(items)
    }
}
