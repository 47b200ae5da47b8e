//! # Payload Providers
//!
//! A load command's payload is not materialized until the file is written.
//! Payloads are produced through a narrow source abstraction with two
//! concrete forms: an owned buffer of already-computed bytes, and a reader
//! that pulls windows straight out of the target process on demand (see
//! `platform::macos::memory::TaskMemorySource`). The latter exists because
//! stack and code segments can be arbitrarily large and are streamed out in
//! chunks rather than copied wholesale.

use crate::error::{DumpError, Result};
use crate::zone::ZoneBuffer;

/// Source of a load command's payload bytes.
///
/// `window` may reuse an internal buffer between calls, which is why it takes
/// `&mut self`; the returned slice is only valid until the next call.
pub trait PayloadSource
{
    /// Total payload size in bytes.
    fn size(&self) -> u64;

    /// Borrow `len` bytes of the payload starting at `offset`.
    fn window(&mut self, offset: u64, len: usize) -> Result<&[u8]>;
}

/// Payload provider over an owned, already-computed buffer.
pub struct CopiedBytes
{
    buffer: ZoneBuffer,
}

impl CopiedBytes
{
    /// Copy `bytes` into the dedicated zone.
    pub fn new(bytes: &[u8]) -> Result<Self>
    {
        Ok(Self {
            buffer: ZoneBuffer::from_slice(bytes)?,
        })
    }

    /// Take ownership of an already zone-allocated buffer.
    pub fn from_buffer(buffer: ZoneBuffer) -> Self
    {
        Self { buffer }
    }
}

impl PayloadSource for CopiedBytes
{
    fn size(&self) -> u64
    {
        self.buffer.len() as u64
    }

    fn window(&mut self, offset: u64, len: usize) -> Result<&[u8]>
    {
        let end = offset
            .checked_add(len as u64)
            .ok_or(DumpError::Layout("payload window overflows"))?;
        if end > self.buffer.len() as u64 {
            return Err(DumpError::Layout("payload window out of bounds"));
        }
        Ok(&self.buffer[offset as usize..end as usize])
    }
}
