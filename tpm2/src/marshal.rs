// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! All integers are big-endian; `TPM2B_*` structures carry a 16-bit size prefix.

use anyhow::{bail, Context, Result};

/// Buffer for building TPM commands and structures
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
    /// Length of the first field too large for its size prefix
    oversized: Option<usize>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            oversized: None,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data).
    ///
    /// Data over 64 KiB is not written; [`CommandBuffer::finish`] reports it.
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        match u16::try_from(data.len()) {
            Ok(len) => {
                self.put_u16(len);
                self.put_bytes(data);
            }
            Err(_) => self.mark_oversized(data.len()),
        }
    }

    /// Put a one-octet size prefix followed by `data`
    pub fn put_sized_u8(&mut self, data: &[u8]) {
        match u8::try_from(data.len()) {
            Ok(len) => {
                self.put_u8(len);
                self.put_bytes(data);
            }
            Err(_) => self.mark_oversized(data.len()),
        }
    }

    /// Put the contents of `inner` as a TPM2B, carrying over its size errors
    pub fn put_nested(&mut self, inner: CommandBuffer) {
        if let Some(len) = inner.oversized {
            self.mark_oversized(len);
        }
        self.put_tpm2b(&inner.data);
    }

    /// Put the contents of `other` without a size prefix
    pub fn append(&mut self, other: CommandBuffer) {
        if let Some(len) = other.oversized {
            self.mark_oversized(len);
        }
        self.put_bytes(&other.data);
    }

    fn mark_oversized(&mut self, len: usize) {
        self.oversized.get_or_insert(len);
    }

    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Marshal `value` into a nested buffer and put it as a TPM2B
    pub fn put_sized<T: Marshal + ?Sized>(&mut self, value: &T) {
        let mut inner = CommandBuffer::new();
        value.marshal(&mut inner);
        self.put_nested(inner);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// The marshalled bytes, or an error if a field overflowed its size prefix
    pub fn finish(self) -> Result<Vec<u8>> {
        if let Some(len) = self.oversized {
            bail!("field of {len} bytes exceeds its size prefix");
        }
        Ok(self.data)
    }

    /// Overwrite a u32 at `pos` (size fields patched after the body is known)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor over a TPM response or marshalled structure
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            bail!(
                "buffer underflow reading {len} bytes (remaining: {})",
                self.remaining()
            );
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Read a TPM2B and unmarshal its whole contents as `T`
    pub fn get_sized<T: Unmarshal>(&mut self) -> Result<T> {
        let size = self.get_u16()? as usize;
        let inner = self.take(size)?;
        T::from_bytes(inner)
    }

    pub fn get_remaining(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        self.clone().take(len)
    }

    /// Fail if anything is left unread
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            bail!("{} trailing bytes after structure", self.remaining());
        }
        Ok(())
    }
}

/// Types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Unmarshal a complete structure; trailing bytes are an error
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let value = Self::unmarshal(&mut buf)?;
        buf.finish()
            .with_context(|| format!("decoding {}", std::any::type_name::<Self>()))?;
        Ok(value)
    }
}

macro_rules! impl_marshal_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.$put(*self);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    buf.$get()
                }
            }
        )*
    };
}

impl_marshal_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut buf = CommandBuffer::new();
        buf.put_u16(0x8001);
        buf.put_u32(0x0000017E);
        buf.put_tpm2b(&[0xAA, 0xBB]);
        assert_eq!(
            buf.as_bytes(),
            &[0x80, 0x01, 0x00, 0x00, 0x01, 0x7E, 0x00, 0x02, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut buf = ResponseBuffer::new(&[0x00, 0x05, 0x01]);
        assert!(buf.get_tpm2b().is_err());

        let mut buf = ResponseBuffer::new(&[0x01]);
        assert!(buf.get_u32().is_err());
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        assert_eq!(u16::from_bytes(&[0x12, 0x34]).unwrap(), 0x1234);
        assert!(u16::from_bytes(&[0x12, 0x34, 0x00]).is_err());
    }

    #[test]
    fn test_sized_nesting() {
        let mut buf = CommandBuffer::new();
        buf.put_sized(&0xDEADBEEFu32);
        let bytes = buf.into_vec();
        assert_eq!(&bytes[..2], &[0x00, 0x04]);

        let mut rd = ResponseBuffer::new(&bytes);
        assert_eq!(rd.get_sized::<u32>().unwrap(), 0xDEADBEEF);
        rd.finish().unwrap();
    }

    #[test]
    fn test_oversized_fields_are_reported() {
        let mut buf = CommandBuffer::new();
        buf.put_u16(0x8001);
        buf.put_tpm2b(&vec![0u8; u16::MAX as usize + 1]);
        assert_eq!(buf.as_bytes(), &[0x80, 0x01]);
        assert!(buf.finish().is_err());

        let mut buf = CommandBuffer::new();
        buf.put_sized_u8(&[0u8; 256]);
        assert!(buf.finish().is_err());

        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&vec![0u8; 70_000]);
        let mut outer = CommandBuffer::new();
        outer.put_nested(inner);
        assert!(outer.finish().is_err());

        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(&vec![0u8; u16::MAX as usize]);
        assert_eq!(buf.finish().unwrap().len(), u16::MAX as usize + 2);
    }
}
