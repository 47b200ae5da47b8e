//! # Random-Access Byte Sinks
//!
//! The builder writes the core file through a small seek/write/truncate
//! abstraction so it can target either a raw file descriptor (the signal
//! handler path, where only an fd is safe to hold) or a `std::fs::File`.
//!
//! Positional writes must be honored after seeks: the builder writes load
//! command headers at the front of the file and payloads at computed offsets
//! further in, in whatever order is convenient.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::error::{DumpError, Result};

/// Seekable, truncatable byte sink the core file is written to.
pub trait RandomAccessSink
{
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn position(&mut self) -> Result<u64>;
    fn set_position(&mut self, pos: u64) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
    fn set_size(&mut self, size: u64) -> Result<()>;
}

/// Sink backed by an owned [`std::fs::File`].
pub struct FileSink
{
    file: File,
}

impl FileSink
{
    pub fn new(file: File) -> Self
    {
        Self { file }
    }
}

impl From<File> for FileSink
{
    fn from(file: File) -> Self
    {
        Self::new(file)
    }
}

impl RandomAccessSink for FileSink
{
    fn write(&mut self, data: &[u8]) -> Result<()>
    {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()>
    {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn position(&mut self) -> Result<u64>
    {
        Ok(self.file.stream_position()?)
    }

    fn set_position(&mut self, pos: u64) -> Result<()>
    {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64>
    {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, size: u64) -> Result<()>
    {
        self.file.set_len(size)?;
        Ok(())
    }
}

/// Sink backed by a raw file descriptor.
///
/// Takes ownership of the descriptor and closes it on drop. This is the
/// variant the in-process crash path uses: the handler opens the core file
/// before anything else and hands the raw fd down, so no allocating
/// `File`/`BufWriter` machinery is involved.
#[cfg(unix)]
pub struct FdSink
{
    fd: libc::c_int,
}

#[cfg(unix)]
impl FdSink
{
    /// Wrap `fd`. The sink owns the descriptor from here on.
    pub fn new(fd: libc::c_int) -> Self
    {
        Self { fd }
    }

    fn seek(&mut self, offset: i64, whence: libc::c_int) -> Result<u64>
    {
        let pos = unsafe { libc::lseek(self.fd, offset, whence) };
        if pos < 0 {
            return Err(DumpError::SinkIo(std::io::Error::last_os_error()));
        }
        Ok(pos as u64)
    }
}

#[cfg(unix)]
impl RandomAccessSink for FdSink
{
    fn write(&mut self, data: &[u8]) -> Result<()>
    {
        let mut remaining = data;
        while !remaining.is_empty() {
            let written = unsafe { libc::write(self.fd, remaining.as_ptr().cast(), remaining.len()) };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(DumpError::SinkIo(err));
            }
            remaining = &remaining[written as usize..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()>
    {
        if unsafe { libc::fsync(self.fd) } != 0 {
            return Err(DumpError::SinkIo(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn position(&mut self) -> Result<u64>
    {
        self.seek(0, libc::SEEK_CUR)
    }

    fn set_position(&mut self, pos: u64) -> Result<()>
    {
        self.seek(pos as i64, libc::SEEK_SET)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64>
    {
        let previous = self.seek(0, libc::SEEK_CUR)?;
        let size = self.seek(0, libc::SEEK_END)?;
        self.seek(previous as i64, libc::SEEK_SET)?;
        Ok(size)
    }

    fn set_size(&mut self, size: u64) -> Result<()>
    {
        if unsafe { libc::ftruncate(self.fd, size as i64) } != 0 {
            return Err(DumpError::SinkIo(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FdSink
{
    fn drop(&mut self)
    {
        if self.fd >= 0 {
            unsafe {
                let _ = libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_file_sink_positional_writes()
    {
        let file = tempfile::tempfile().unwrap();
        let mut sink = FileSink::new(file);

        sink.write(b"aaaaaaaa").unwrap();
        sink.set_position(4).unwrap();
        sink.write(b"bb").unwrap();
        sink.set_position(0).unwrap();

        assert_eq!(sink.size().unwrap(), 8);
        assert_eq!(sink.position().unwrap(), 0);
    }

    #[test]
    fn test_file_sink_truncate()
    {
        let file = tempfile::tempfile().unwrap();
        let mut sink = FileSink::new(file);

        sink.write(b"0123456789").unwrap();
        sink.set_size(0).unwrap();
        assert_eq!(sink.size().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_sink_write_and_size()
    {
        use std::os::fd::IntoRawFd;

        let file = tempfile::tempfile().unwrap();
        let mut sink = FdSink::new(file.into_raw_fd());

        sink.write(b"hello").unwrap();
        assert_eq!(sink.size().unwrap(), 5);
        sink.set_position(1).unwrap();
        assert_eq!(sink.position().unwrap(), 1);
    }
}
