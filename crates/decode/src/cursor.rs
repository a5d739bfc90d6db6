use crate::octets::be_uint;
use crate::DecodeError;

/// Forward-only reader over a TLV stream.
///
/// Every read is bounds-checked; running off the end yields
/// [`DecodeError::Truncated`] rather than a short slice.
#[derive(Debug, Clone)]
pub struct TlvCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Next single octet.
    pub fn read_tag(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Two-byte big-endian length.
    pub fn read_length(&mut self) -> Result<usize, DecodeError> {
        Ok(be_uint(self.take(2)?)? as usize)
    }

    /// A two-byte length followed by that many bytes of value.
    pub fn read_length_prefixed_value(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_length()?;
        self.take(len)
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn advance(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }
}
