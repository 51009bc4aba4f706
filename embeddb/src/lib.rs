//! An append-only, time-series-oriented key-value storage engine for
//! memory-constrained embedded systems.
//!
//! Keys are monotonically ascending integers; values are fixed-size records
//! optionally paired with variable-length blobs. Storage is a fixed ring of
//! pages over a [`StorageDevice`](embeddb_block_device::StorageDevice) with
//! erase-block semantics: when the ring wraps, the oldest pages are erased
//! and their records become unreachable. Point lookups go through an online
//! learned spline index that maps a key to an estimated page plus a bounded
//! error corridor.
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! embeddb = "0.1"
//! embeddb-adapters = "0.1"
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use embeddb::{EmbedDb, EmbedDbConfig, Storage};
//! use embeddb_adapters::MemStorage;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut cfg = EmbedDbConfig::new(4, 12);
//!     cfg.num_data_pages = 64;
//!     let storage = Storage::data_only(MemStorage::new(64, cfg.page_size));
//!
//!     let mut db = EmbedDb::init(cfg, storage).await?;
//!     db.put(1, &[0u8; 12]).await?;
//!     db.flush().await?;
//!
//!     let mut data = [0u8; 12];
//!     db.get(1, &mut data).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Subsystems
//!
//! - Optional per-page bitmaps plus a secondary index file let range
//!   iterators skip pages that cannot match a data-value predicate.
//! - Optional variable-length blobs live in a parallel page ring and stream
//!   back through [`VarDataStream`].
//! - Optional record-level consistency makes every `put` durable by copying
//!   the partial page into a rotating scratch window; recovery on open
//!   restores the interrupted write buffer.
//!
//! # Concurrency
//!
//! The engine is single-owner and single-threaded; the only suspension
//! points are the storage device's async operations. There are no internal
//! locks or tasks.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc
)]

#[cfg(not(feature = "std"))]
extern crate alloc;

// MUST be the first module listed
mod fmt;

mod bitmap;
mod buffer;
mod config;
mod db;
mod error;
mod index;
mod iterator;
mod recovery;
mod search;
mod spline;
mod vardata;

pub use crate::bitmap::{BITMAP_8_U32, BITMAP_64_U32};
pub use crate::config::{
    BitmapOps, CompareData, EmbedDbConfig, Params, compare_signed, compare_unsigned,
};
pub use crate::db::{EmbedDb, Stats, Storage};
pub use crate::error::Error;
pub use crate::iterator::{IterQuery, QueryIterator};
pub use crate::vardata::{VarDataStream, VarRecord};

pub use embeddb_block_device::{SendStorageDevice, StorageDevice};
