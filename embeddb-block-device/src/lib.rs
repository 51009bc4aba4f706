//! Core storage device abstraction for the embeddb ecosystem.
//!
//! This crate provides the fundamental [`StorageDevice`] trait that defines
//! how flash- or SD-backed media are accessed in a page-oriented manner.
//!
//! # Features
//!
//! - `no_std` compatible by default
//! - Async-first design using native async fn in traits
//! - Erase-block semantics for flash media (a no-op on media without erase)
//! - Two trait variants: [`StorageDevice`] (single-threaded) and
//!   [`SendStorageDevice`] (multi-threaded)
//!
//! # Example
//!
//! ```ignore
//! use embeddb_block_device::StorageDevice;
//!
//! struct MyDevice;
//!
//! impl StorageDevice for MyDevice {
//!     type Error = std::io::Error;
//!
//!     async fn read_page(&mut self, page: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
//!         // Read implementation
//!         Ok(())
//!     }
//!
//!     async fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), Self::Error> {
//!         // Write implementation
//!         Ok(())
//!     }
//!
//!     async fn erase_pages(&mut self, start: u32, end: u32) -> Result<(), Self::Error> {
//!         // Clear the range, or do nothing on media that overwrites in place
//!         Ok(())
//!     }
//!
//!     async fn flush(&mut self) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![allow(async_fn_in_trait)]

/// A trait for page-granular storage devices.
///
/// All addresses are zero indexed, and the unit is pages. The page size is
/// fixed by the device when it is constructed; callers always pass buffers of
/// exactly one page. An engine using several files (data, index, variable
/// data) holds one `StorageDevice` per file.
///
/// Reading a page that was never written (or lies beyond the medium) is
/// allowed to fail; callers performing recovery scans treat such failures as
/// "no more data", not as fatal errors.
///
/// # Erase semantics
///
/// [`erase_pages`](StorageDevice::erase_pages) clears the half-open page range
/// `[start, end)`. On NOR/NAND flash this maps to an erase-block operation;
/// on media that can overwrite in place (files, RAM) it may be a no-op.
/// Callers must never interpret the contents of erased pages.
///
/// # Thread Safety
///
/// This trait generates two variants via [`trait_variant::make`]:
/// - [`StorageDevice`] - For single-threaded or `no_std` embedded contexts (no `Send` requirement)
/// - [`SendStorageDevice`] - For multi-threaded contexts where futures must be `Send`
#[trait_variant::make(SendStorageDevice: Send)]
pub trait StorageDevice {
    /// The error type for the StorageDevice implementation.
    type Error: core::fmt::Debug;

    /// Read one page at the given page address into `buf`.
    ///
    /// `buf.len()` is the device page size.
    async fn read_page(&mut self, page: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write one page at the given page address from `buf`.
    ///
    /// `buf.len()` is the device page size.
    async fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), Self::Error>;

    /// Erase the page range `[start, end)`.
    ///
    /// May be a no-op on media without erase. The contents of erased pages
    /// are unspecified.
    async fn erase_pages(&mut self, start: u32, end: u32) -> Result<(), Self::Error>;

    /// Push any buffered writes down to the physical medium.
    async fn flush(&mut self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod test {
    use super::*;
    use core::future::Future;

    struct NullDevice;

    impl StorageDevice for NullDevice {
        type Error = core::convert::Infallible;

        async fn read_page(&mut self, _page: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
            buf.fill(0);
            Ok(())
        }

        async fn write_page(&mut self, _page: u32, _buf: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn erase_pages(&mut self, _start: u32, _end: u32) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    async fn exercise<D: StorageDevice>(dev: &mut D) -> Result<(), D::Error> {
        let mut buf = [0u8; 64];
        dev.read_page(0, &mut buf).await?;
        dev.write_page(0, &buf).await?;
        dev.erase_pages(0, 4).await?;
        dev.flush().await
    }

    #[test]
    fn futures_resolve_without_a_runtime() {
        // Every await in a trivial device is immediately ready, so a single
        // poll with a no-op waker drives the whole exercise.
        let fut = async {
            let mut dev = NullDevice;
            exercise(&mut dev).await.unwrap();
        };
        let mut fut = core::pin::pin!(fut);
        let mut cx = core::task::Context::from_waker(core::task::Waker::noop());
        assert!(fut.as_mut().poll(&mut cx).is_ready());
    }
}
