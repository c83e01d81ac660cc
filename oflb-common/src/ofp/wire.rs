use bytes::{Buf, BufMut, BytesMut};

use super::CodecError;

/// Big-endian cursor over a received message body.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let buf: &'a [u8] = self.buf;
        let (head, rest) = buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Splits off the next `n` bytes as an independent reader.
    pub(crate) fn sub(&mut self, n: usize) -> Result<Reader<'a>, CodecError> {
        self.bytes(n).map(Reader::new)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.need(N)?;
        let mut arr = [0u8; N];
        self.buf.copy_to_slice(&mut arr);
        Ok(arr)
    }
}

pub(crate) fn pad_to_8(buf: &mut BytesMut, start: usize) {
    let len = buf.len() - start;
    buf.put_bytes(0, padding(len));
}

pub(crate) fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Overwrites a big-endian u16 length field at `at` once the element is complete.
pub(crate) fn patch_len(buf: &mut [u8], at: usize, len: usize) -> Result<(), CodecError> {
    let len = u16::try_from(len).map_err(|_| CodecError::TooLong(len))?;
    buf[at..at + 2].copy_from_slice(&len.to_be_bytes());
    Ok(())
}
