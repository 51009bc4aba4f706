//! Storage device adapters for the embeddb ecosystem.
//!
//! This crate provides concrete [`embeddb_block_device::StorageDevice`]
//! implementations:
//!
//! - [`MemStorage`]: a RAM-backed page array with flash-like erase (0xFF).
//!   Doubles as the crash simulator in the engine's recovery tests.
//! - [`StreamStorage`]: a page device over any
//!   `embedded_io_async::{Read, Write, Seek}` stream, such as a file opened
//!   through `embedded-io-adapters`.
//!
//! # Example: file-backed storage
//!
//! ```ignore
//! use embeddb_adapters::StreamStorage;
//! use embedded_io_adapters::tokio_1::FromTokio;
//!
//! let file = tokio::fs::OpenOptions::new()
//!     .read(true).write(true).create(true)
//!     .open("data.edb").await?;
//! let device = StreamStorage::new(FromTokio::new(file), 512);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// MUST be the first module listed
mod fmt;

mod mem;
mod stream;

pub use mem::{ERASED_BYTE, MemStorage, MemStorageError};
pub use stream::{StreamStorage, StreamStorageError};
