//! Point lookup
//!
//! A `get` first probes the write buffer, then picks a candidate page either
//! from the spline (estimate plus error corridor, refined by stepping
//! neighboring pages) or by binary search over page headers, and finally
//! runs a slope-estimated binary search inside the page.

use embeddb_block_device::StorageDevice;

use crate::buffer::{DATA_READ_BUFFER, DATA_WRITE_BUFFER};
use crate::db::EmbedDb;
use crate::error::Error;

impl<D: StorageDevice> EmbedDb<D> {
    /// Estimated record slot of `key` within a page, from the page's key
    /// slope.
    pub(crate) fn estimate_key_location(&self, buf: &[u8], key: u64) -> i32 {
        let layout = self.layout;
        let slope = Self::page_slope(layout, buf);
        let min_key = layout.first_key(buf);
        (key.saturating_sub(min_key) as f32 / slope) as i32
    }

    /// Bounded binary search for `key` inside a page, starting from the
    /// linear estimate. With `range`, returns the floor slot instead of
    /// failing on a miss.
    pub(crate) fn search_node(&self, buf: &[u8], key: u64, range: bool) -> Option<usize> {
        let layout = self.layout;
        let count = layout.record_count(buf) as i32;
        if count == 0 {
            return None;
        }

        let mut first = 0i32;
        let mut last = count - 1;
        let mut middle = self.estimate_key_location(buf, key);
        if middle <= 0 || middle >= count {
            middle = (first + last) / 2;
        }
        if middle > last {
            middle = last;
        }

        while first <= last {
            let mkey = layout.record_key(buf, middle as usize);
            match mkey.cmp(&key) {
                core::cmp::Ordering::Less => first = middle + 1,
                core::cmp::Ordering::Equal => return Some(middle as usize),
                core::cmp::Ordering::Greater => last = middle - 1,
            }
            middle = (first + last) / 2;
        }
        if range && middle >= 0 {
            Some(middle as usize)
        } else {
            None
        }
    }

    /// Search the write buffer; on a hit, copy the record's data out and
    /// return its slot.
    pub(crate) fn search_write_buffer(&self, key: u64, data: &mut [u8]) -> Option<usize> {
        let layout = self.layout;
        let buf = self.pool.page(DATA_WRITE_BUFFER);
        if layout.record_count(buf) == 0 {
            return None;
        }
        let slot = self.search_node(buf, key, false)?;
        data.copy_from_slice(layout.record_data(buf, slot));
        Some(slot)
    }

    /// Step pages around the estimate until one brackets `key` in its
    /// first/last record, shrinking the corridor as headers rule pages out.
    pub(crate) async fn linear_in_error_search(
        &mut self,
        key: u64,
        start: u32,
        low: u32,
        high: u32,
    ) -> Result<bool, Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        let mut page_id = start as i64;
        let mut low = low as i64;
        let mut high = high as i64;

        loop {
            if page_id > high
                || page_id < low
                || low > high
                || page_id < self.min_data_page_id as i64
                || page_id >= self.next_data_page_id as i64
            {
                return Ok(false);
            }
            let phys = (page_id as u32) % num;
            if self.read_page(phys).await.is_err() {
                return Ok(false);
            }
            let buf = self.pool.page(DATA_READ_BUFFER);
            if key < layout.first_key(buf) {
                page_id -= 1;
                high = page_id;
            } else if key > layout.last_key(buf) {
                page_id += 1;
                low = page_id;
            } else {
                return Ok(true);
            }
        }
    }

    /// Spline-guided candidate page selection.
    pub(crate) async fn spline_search(&mut self, key: u64) -> Result<bool, Error<D::Error>> {
        let layout = self.layout;
        let (mut loc, mut low, high) = match self.spline.as_ref() {
            Some(spl) if spl.len() > 0 => spl.find(key),
            _ => return Ok(false),
        };

        // The spline can only point below the ring tail for reclaimed pages.
        if high < self.min_data_page_id {
            return Ok(false);
        }
        if low < self.min_data_page_id {
            low = self.min_data_page_id;
            loc = low.midpoint(high);
        }

        // The buffered page may already be the right one.
        if let Some(buffered) = self.buffered_page_id {
            let buf = self.pool.page(DATA_READ_BUFFER);
            if low <= buffered
                && buffered <= high
                && layout.record_count(buf) > 0
                && layout.first_key(buf) <= key
                && key <= layout.last_key(buf)
            {
                return Ok(true);
            }
        }

        self.linear_in_error_search(key, loc, low, high).await
    }

    /// Binary search over page headers in `[min_data_page_id,
    /// next_data_page_id)`.
    pub(crate) async fn binary_search_pages(&mut self, key: u64) -> Result<bool, Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        let mut first = self.min_data_page_id;
        let mut last = self.next_data_page_id - 1;
        let mut page_id = first.midpoint(last);

        loop {
            if self.read_page(page_id % num).await.is_err() {
                return Ok(false);
            }
            let buf = self.pool.page(DATA_READ_BUFFER);
            if key < layout.first_key(buf) {
                if page_id == first {
                    return Ok(false);
                }
                last = page_id - 1;
            } else if key > layout.last_key(buf) {
                if page_id == last {
                    return Ok(false);
                }
                first = page_id + 1;
            } else {
                return Ok(true);
            }
            if first > last {
                return Ok(false);
            }
            page_id = first.midpoint(last);
        }
    }

    /// Look up `key` and copy its data into `data`.
    ///
    /// Returns [`Error::NotFound`] for keys never inserted or displaced by
    /// ring wrap.
    pub async fn get(&mut self, key: u64, data: &mut [u8]) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        if data.len() != layout.data_size {
            return Err(Error::InvalidInput);
        }

        if self.next_data_page_id == 0 {
            // Nothing on disk yet; only the write buffer can hold the key.
            return match self.search_write_buffer(key, data) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound),
            };
        }

        let wb = self.pool.page(DATA_WRITE_BUFFER);
        if layout.record_count(wb) != 0 {
            let buf_min = layout.first_key(wb);
            let buf_max = layout.last_key(wb);
            if key > buf_max {
                return Err(Error::NotFound);
            }
            if key >= buf_min {
                return match self.search_write_buffer(key, data) {
                    Some(_) => Ok(()),
                    None => Err(Error::NotFound),
                };
            }
        }

        let found = if self.cfg.use_spline() {
            self.spline_search(key).await?
        } else {
            self.binary_search_pages(key).await?
        };
        if !found {
            trace!("no candidate page for key {}", key);
            return Err(Error::NotFound);
        }

        let buf = self.pool.page(DATA_READ_BUFFER);
        match self.search_node(buf, key, false) {
            Some(slot) => {
                data.copy_from_slice(layout.record_data(buf, slot));
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }
}
