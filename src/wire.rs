//! Small helpers for hand-rolled wire formats built from consensus
//! primitives.

use bitcoin::consensus::encode::{deserialize_partial, Encodable, VarInt};
use bitcoin::consensus::Decodable;

use crate::error::{Error, Result};

/// A forward-only reader over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn take<T: Decodable>(&mut self) -> Result<T> {
        let (value, used) = deserialize_partial(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn var_int(&mut self) -> Result<u64> {
        Ok(self.take::<VarInt>()?.0)
    }

    pub fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::InvalidSyntax("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidSyntax("unexpected end of input".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Append a consensus-encodable value.
pub(crate) fn put<T: Encodable>(out: &mut Vec<u8>, value: &T) {
    value
        .consensus_encode(out)
        .expect("writing to a Vec cannot fail");
}

/// Append a variable-length integer.
pub(crate) fn put_var_int(out: &mut Vec<u8>, n: u64) {
    put(out, &VarInt(n));
}
