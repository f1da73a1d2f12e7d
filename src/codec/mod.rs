//! MQTT v3.1 / v3.1.1 wire codec
//!
//! Framing is a one-byte header, a 1-4 byte remaining length and a body.
//! The body is read with [`Reader`], which works on a complete frame, so a
//! field running past the end of the body is a malformed packet rather than
//! a request for more input.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Largest value a 4-byte remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Parse the remaining length that follows the header byte.
///
/// Returns `(length, bytes used)`, or `None` while the encoding is cut off.
pub fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut length = 0usize;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::RemainingLengthOverflow);
        }
        length |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((length, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(DecodeError::RemainingLengthOverflow);
    }
    Ok(None)
}

pub fn put_remaining_length(buf: &mut BytesMut, length: usize) -> Result<(), EncodeError> {
    if length > MAX_REMAINING_LENGTH {
        return Err(EncodeError::RemainingLengthOverflow(length));
    }
    let mut rest = length;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(());
        }
        buf.put_u8(digit | 0x80);
    }
}

/// Write a u16 length prefix followed by `data` (MQTT strings and binary data)
pub fn put_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong(data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Cursor over the body of one complete frame
pub(crate) struct Reader<'a> {
    body: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.body.len() < n {
            return Err(DecodeError::Malformed(what));
        }
        let (head, tail) = self.body.split_at(n);
        self.body = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Packet identifier, which must not be 0
    pub(crate) fn packet_id(&mut self) -> Result<u16, DecodeError> {
        match self.u16("truncated packet id")? {
            0 => Err(DecodeError::Malformed("packet id cannot be 0")),
            id => Ok(id),
        }
    }

    pub(crate) fn binary(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u16(what)?;
        self.take(usize::from(len), what)
    }

    /// UTF-8 string; U+0000 is not allowed
    pub(crate) fn string(&mut self, what: &'static str) -> Result<&'a str, DecodeError> {
        let s = std::str::from_utf8(self.binary(what)?).map_err(|_| DecodeError::InvalidUtf8)?;
        if s.contains('\0') {
            return Err(DecodeError::Malformed("string contains U+0000"));
        }
        Ok(s)
    }

    /// Everything not read yet
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.body)
    }
}
