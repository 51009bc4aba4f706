//! Storage device over a byte stream
//!
//! Adapts any `embedded_io_async::{Read, Write, Seek}` stream (a file, a
//! cursor, a partition slice) into a page-granular [`StorageDevice`]. Erase
//! writes 0xFF pages over the range; media that cannot benefit from erase
//! simply see ordinary writes.

use alloc::vec;
use alloc::vec::Vec;

use embedded_io_async::{Read, Seek, SeekFrom, Write};

use embeddb_block_device::StorageDevice;

/// Error type for [`StreamStorage`] operations
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum StreamStorageError<E> {
    /// Underlying stream error
    Io(E),
    /// The stream ended before a full page could be read
    UnexpectedEof,
}

impl<E> From<E> for StreamStorageError<E> {
    fn from(e: E) -> Self {
        Self::Io(e)
    }
}

impl<E: core::fmt::Display> core::fmt::Display for StreamStorageError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::UnexpectedEof => write!(f, "stream ended inside a page"),
        }
    }
}

impl<E: core::fmt::Debug + core::fmt::Display> core::error::Error for StreamStorageError<E> {}

/// A page device over a seekable byte stream
pub struct StreamStorage<T: Read + Write + Seek> {
    inner: T,
    page_size: usize,
    erase_page: Vec<u8>,
}

impl<T: Read + Write + Seek> StreamStorage<T> {
    /// Wrap a stream as a page device with the given page size.
    pub fn new(inner: T, page_size: usize) -> Self {
        Self {
            inner,
            page_size,
            erase_page: vec![0xFF; page_size],
        }
    }

    /// The device page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the inner stream, consuming this device.
    pub fn into_inner(self) -> T {
        self.inner
    }

    async fn seek_to(&mut self, page: u32) -> Result<(), T::Error> {
        self.inner
            .seek(SeekFrom::Start(u64::from(page) * self.page_size as u64))
            .await?;
        Ok(())
    }
}

impl<T: Read + Write + Seek> StorageDevice for StreamStorage<T> {
    type Error = StreamStorageError<T::Error>;

    async fn read_page(&mut self, page: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.seek_to(page).await?;
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.inner.read(&mut buf[offset..]).await?;
            if n == 0 {
                return Err(StreamStorageError::UnexpectedEof);
            }
            offset += n;
        }
        Ok(())
    }

    async fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.seek_to(page).await?;
        let mut offset = 0;
        while offset < buf.len() {
            let n = self.inner.write(&buf[offset..]).await?;
            if n == 0 {
                return Err(StreamStorageError::UnexpectedEof);
            }
            offset += n;
        }
        Ok(())
    }

    async fn erase_pages(&mut self, start: u32, end: u32) -> Result<(), Self::Error> {
        if start >= end {
            return Ok(());
        }
        trace!("erasing pages {}..{}", start, end);
        self.seek_to(start).await?;
        for _ in start..end {
            let mut offset = 0;
            while offset < self.page_size {
                let n = self.inner.write(&self.erase_page[offset..]).await?;
                if n == 0 {
                    return Err(StreamStorageError::UnexpectedEof);
                }
                offset += n;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.inner.flush().await?;
        Ok(())
    }
}
