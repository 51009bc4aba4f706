//! Range iteration
//!
//! A [`QueryIterator`] walks records in key order between optional key and
//! data bounds. With a bitmap configured, the query's data range compiles to
//! a query bitmap and index pages prune data pages whose stored bitmap
//! cannot overlap it.

#[cfg(not(feature = "std"))]
use alloc::vec;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use core::cmp::Ordering;

use embeddb_block_device::StorageDevice;

use crate::buffer::{DATA_READ_BUFFER, DATA_WRITE_BUFFER, INDEX_READ_BUFFER};
use crate::db::EmbedDb;
use crate::error::Error;
use crate::vardata::VarRecord;

/// Bounds for a range query. `None` bounds are open.
#[derive(Debug, Default, Clone)]
pub struct IterQuery {
    /// Smallest key to return.
    pub min_key: Option<u64>,
    /// Largest key to return.
    pub max_key: Option<u64>,
    /// Smallest data value to return, `data_size` bytes.
    pub min_data: Option<Vec<u8>>,
    /// Largest data value to return, `data_size` bytes.
    pub max_data: Option<Vec<u8>>,
}

/// Cursor state for a range query; drive it with [`EmbedDb::next`].
#[derive(Debug)]
pub struct QueryIterator {
    min_key: Option<u64>,
    max_key: Option<u64>,
    min_data: Option<Vec<u8>>,
    max_data: Option<Vec<u8>>,
    query_bitmap: Option<Vec<u8>>,
    next_data_page: u32,
    next_data_rec: u32,
    last_from_write_buffer: bool,
}

/// Do two bitmaps share any set bit?
pub(crate) fn bitmap_overlap(a: &[u8], b: &[u8]) -> bool {
    a.iter().zip(b.iter()).any(|(x, y)| x & y != 0)
}

impl<D: StorageDevice> EmbedDb<D> {
    /// Start a range query. The spline positions the cursor at the first
    /// page that can hold `min_key`.
    pub fn init_iterator(&self, query: IterQuery) -> QueryIterator {
        let mut query_bitmap = None;
        if self.cfg.use_bitmap() {
            if query.min_data.is_some() || query.max_data.is_some() {
                if let Some(ops) = self.cfg.bitmap {
                    let mut bm = vec![0u8; self.cfg.bitmap_size];
                    (ops.build_range)(
                        query.min_data.as_deref(),
                        query.max_data.as_deref(),
                        &mut bm,
                    );
                    query_bitmap = Some(bm);
                }
            }
        } else if query.min_data.is_some() || query.max_data.is_some() {
            warn!("iterating a data range without a bitmap reads every page");
        }

        let next_data_page = match (&self.spline, query.min_key) {
            (Some(spl), Some(min_key)) if spl.len() > 0 => {
                let (_, low, _) = spl.find(min_key);
                low.max(self.min_data_page_id)
            }
            _ => self.min_data_page_id,
        };

        QueryIterator {
            min_key: query.min_key,
            max_key: query.max_key,
            min_data: query.min_data,
            max_data: query.max_data,
            query_bitmap,
            next_data_page,
            next_data_rec: 0,
            last_from_write_buffer: false,
        }
    }

    /// Advance the iterator. On a hit the key and data land in the out
    /// parameters and `Ok(true)` is returned; `Ok(false)` means the query is
    /// exhausted.
    pub async fn next(
        &mut self,
        it: &mut QueryIterator,
        key: &mut u64,
        data: &mut [u8],
    ) -> Result<bool, Error<D::Error>> {
        let layout = self.layout;
        if data.len() != layout.data_size {
            return Err(Error::InvalidInput);
        }
        let cmp = self.cfg.compare_data;

        loop {
            if it.next_data_page > self.next_data_page_id {
                return Ok(false);
            }
            let search_write_buf = it.next_data_page == self.next_data_page_id;

            // Entering a new page: ask the index whether it can match at all.
            if !search_write_buf && it.next_data_rec == 0 {
                if let Some(query_bm) = it.query_bitmap.as_ref() {
                    let per_page = layout.max_idx_records_per_page as u32;
                    let idx_page = it.next_data_page / per_page;
                    let idx_rec = (it.next_data_page % per_page) as usize;
                    if self.storage.index.is_some()
                        && idx_page >= self.min_index_page_id
                        && idx_page < self.next_idx_page_id
                    {
                        self.read_index_page(idx_page % self.cfg.num_index_pages)
                            .await?;
                        let page_bm =
                            layout.idx_bitmap(self.pool.page(INDEX_READ_BUFFER), idx_rec);
                        if !bitmap_overlap(query_bm, page_bm) {
                            it.next_data_page += 1;
                            continue;
                        }
                    }
                }
            }

            if !search_write_buf {
                self.read_page(it.next_data_page % self.cfg.num_data_pages)
                    .await?;
            }
            let buf = if search_write_buf {
                self.pool.page(DATA_WRITE_BUFFER)
            } else {
                self.pool.page(DATA_READ_BUFFER)
            };

            let count = layout.record_count(buf) as u32;
            while it.next_data_rec < count {
                let rec = it.next_data_rec as usize;
                it.next_data_rec += 1;

                let k = layout.record_key(buf, rec);
                if let Some(min) = it.min_key {
                    if k < min {
                        continue;
                    }
                }
                if let Some(max) = it.max_key {
                    if k > max {
                        return Ok(false);
                    }
                }
                let d = layout.record_data(buf, rec);
                if let Some(min) = it.min_data.as_deref() {
                    if cmp(d, min) == Ordering::Less {
                        continue;
                    }
                }
                if let Some(max) = it.max_data.as_deref() {
                    if cmp(d, max) == Ordering::Greater {
                        continue;
                    }
                }

                *key = k;
                data.copy_from_slice(d);
                it.last_from_write_buffer = search_write_buf;
                return Ok(true);
            }

            it.next_data_page += 1;
            it.next_data_rec = 0;
        }
    }

    /// Advance the iterator and open the matched record's variable data.
    /// `Ok(None)` means the query is exhausted.
    pub async fn next_var(
        &mut self,
        it: &mut QueryIterator,
        key: &mut u64,
        data: &mut [u8],
    ) -> Result<Option<VarRecord>, Error<D::Error>> {
        if !self.cfg.use_vdata() {
            return Err(Error::InvalidInput);
        }
        if !self.next(it, key, data).await? {
            return Ok(None);
        }

        if it.last_from_write_buffer {
            // The record has not been written yet: push the variable bytes
            // out and stage the write buffer where stream setup reads from.
            self.flush_var().await?;
            self.pool.copy_page(DATA_WRITE_BUFFER, DATA_READ_BUFFER);
            self.buffered_page_id = None;
        }

        let slot = (it.next_data_rec - 1) as usize;
        let var = self.setup_var_stream(*key, slot).await?;
        Ok(Some(var))
    }
}
