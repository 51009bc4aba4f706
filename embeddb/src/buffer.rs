//! Buffer pool and on-page layout accessors
//!
//! The pool is one owned byte arena split into `buffer_size_in_blocks`
//! page-sized slots with fixed roles: data-write is always slot 0, data-read
//! slot 1, then index write/read and variable write/read when those
//! subsystems are enabled. No references into the arena outlive a single
//! engine operation.
//!
//! Data page layout:
//!
//! ```text
//! offset 0    : logical page id (4 bytes, LE)
//! offset 4    : record count (2 bytes, LE)
//! offset 6    : [bitmap, bitmap_size bytes]
//!               [min key, max key, min data, max data]
//! header_size : record[0] .. record[count-1]
//! ```
//!
//! All integers are little-endian on disk.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::config::{IDX_HEADER_SIZE, Layout};

/// Slot of the data write buffer. Always 0 so `flush` and RLC never have to
/// relocate it.
pub(crate) const DATA_WRITE_BUFFER: usize = 0;
/// Slot of the data read buffer.
pub(crate) const DATA_READ_BUFFER: usize = 1;
/// Slot of the index write buffer (with `USE_INDEX`).
pub(crate) const INDEX_WRITE_BUFFER: usize = 2;
/// Slot of the index read buffer (with `USE_INDEX`).
pub(crate) const INDEX_READ_BUFFER: usize = 3;

/// Read a key of up to 8 little-endian bytes into a `u64`.
pub(crate) fn key_from_bytes(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// Write the low `dst.len()` little-endian bytes of `key`.
pub(crate) fn key_to_bytes(dst: &mut [u8], key: u64) {
    let raw = key.to_le_bytes();
    let n = dst.len();
    dst.copy_from_slice(&raw[..n]);
}

/// The in-memory page buffers.
pub(crate) struct BufferPool {
    page_size: usize,
    bytes: Vec<u8>,
}

impl BufferPool {
    pub fn new(page_size: usize, slots: usize) -> Self {
        let mut bytes = Vec::new();
        bytes.resize(page_size * slots, 0);
        Self { page_size, bytes }
    }

    pub fn page(&self, slot: usize) -> &[u8] {
        let start = slot * self.page_size;
        &self.bytes[start..start + self.page_size]
    }

    pub fn page_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * self.page_size;
        &mut self.bytes[start..start + self.page_size]
    }

    /// Copy one whole slot over another.
    pub fn copy_page(&mut self, src_slot: usize, dst_slot: usize) {
        let src = src_slot * self.page_size;
        let dst = dst_slot * self.page_size;
        self.bytes.copy_within(src..src + self.page_size, dst);
    }

    /// Copy a byte range between two slots.
    pub fn copy_between(
        &mut self,
        src_slot: usize,
        src_off: usize,
        dst_slot: usize,
        dst_off: usize,
        len: usize,
    ) {
        let src = src_slot * self.page_size + src_off;
        let dst = dst_slot * self.page_size + dst_off;
        self.bytes.copy_within(src..src + len, dst);
    }
}

impl Layout {
    pub fn page_id(&self, buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[0..4].try_into().unwrap())
    }

    pub fn set_page_id(&self, buf: &mut [u8], id: u32) {
        buf[0..4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn record_count(&self, buf: &[u8]) -> u16 {
        u16::from_le_bytes(buf[4..6].try_into().unwrap())
    }

    pub fn set_record_count(&self, buf: &mut [u8], count: u16) {
        buf[4..6].copy_from_slice(&count.to_le_bytes());
    }

    pub fn inc_record_count(&self, buf: &mut [u8]) {
        let count = self.record_count(buf) + 1;
        self.set_record_count(buf, count);
    }

    pub fn bitmap<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[6..6 + self.bitmap_size]
    }

    pub fn bitmap_mut<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        &mut buf[6..6 + self.bitmap_size]
    }

    fn minmax_base(&self) -> usize {
        6 + self.bitmap_size
    }

    pub fn header_min_key(&self, buf: &[u8]) -> u64 {
        let at = self.minmax_base();
        key_from_bytes(&buf[at..at + self.key_size])
    }

    pub fn set_header_min_key(&self, buf: &mut [u8], key: u64) {
        let at = self.minmax_base();
        key_to_bytes(&mut buf[at..at + self.key_size], key);
    }

    pub fn set_header_max_key(&self, buf: &mut [u8], key: u64) {
        let at = self.minmax_base() + self.key_size;
        key_to_bytes(&mut buf[at..at + self.key_size], key);
    }

    pub fn header_min_data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let at = self.minmax_base() + 2 * self.key_size;
        &buf[at..at + self.data_size]
    }

    pub fn header_min_data_mut<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        let at = self.minmax_base() + 2 * self.key_size;
        &mut buf[at..at + self.data_size]
    }

    pub fn header_max_data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let at = self.minmax_base() + 2 * self.key_size + self.data_size;
        &buf[at..at + self.data_size]
    }

    pub fn header_max_data_mut<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        let at = self.minmax_base() + 2 * self.key_size + self.data_size;
        &mut buf[at..at + self.data_size]
    }

    fn record_at(&self, idx: usize) -> usize {
        self.header_size + idx * self.record_size
    }

    pub fn record<'a>(&self, buf: &'a [u8], idx: usize) -> &'a [u8] {
        let at = self.record_at(idx);
        &buf[at..at + self.record_size]
    }

    pub fn record_mut<'a>(&self, buf: &'a mut [u8], idx: usize) -> &'a mut [u8] {
        let at = self.record_at(idx);
        &mut buf[at..at + self.record_size]
    }

    pub fn record_key(&self, buf: &[u8], idx: usize) -> u64 {
        let at = self.record_at(idx);
        key_from_bytes(&buf[at..at + self.key_size])
    }

    pub fn record_data<'a>(&self, buf: &'a [u8], idx: usize) -> &'a [u8] {
        let at = self.record_at(idx) + self.key_size;
        &buf[at..at + self.data_size]
    }

    /// Variable-data offset of a record; only meaningful with `USE_VDATA`.
    pub fn record_var_offset(&self, buf: &[u8], idx: usize) -> u32 {
        let at = self.record_at(idx) + self.key_size + self.data_size;
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    /// Smallest key stored on the page (first record).
    pub fn first_key(&self, buf: &[u8]) -> u64 {
        self.record_key(buf, 0)
    }

    /// Largest key stored on the page (last live record).
    pub fn last_key(&self, buf: &[u8]) -> u64 {
        let count = self.record_count(buf) as usize;
        self.record_key(buf, count - 1)
    }

    /// Id of the first data page summarized by an index page, at offset 8.
    pub fn set_idx_first_data_page(&self, buf: &mut [u8], id: u32) {
        buf[8..12].copy_from_slice(&id.to_le_bytes());
    }

    pub fn idx_bitmap<'a>(&self, buf: &'a [u8], idx: usize) -> &'a [u8] {
        let at = IDX_HEADER_SIZE + idx * self.bitmap_size;
        &buf[at..at + self.bitmap_size]
    }

    /// Largest key with data on a variable page, stored after the page id.
    pub fn var_page_key(&self, buf: &[u8]) -> u64 {
        key_from_bytes(&buf[4..4 + self.key_size])
    }

    pub fn set_var_page_key(&self, buf: &mut [u8], key: u64) {
        key_to_bytes(&mut buf[4..4 + self.key_size], key);
    }

    /// Zero a buffer page. For data pages with min/max tracking, the min-key
    /// and min-data header regions are set to 0xFF so the first record's
    /// `min()` updates land.
    pub fn init_page(&self, buf: &mut [u8], with_sentinels: bool) {
        buf.fill(0);
        if with_sentinels && self.use_max_min {
            let at = self.minmax_base();
            buf[at..at + self.key_size].fill(0xFF);
            let at = self.minmax_base() + 2 * self.key_size;
            buf[at..at + self.data_size].fill(0xFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbedDbConfig, Params};

    fn layout_with(params: Params) -> Layout {
        let mut cfg = EmbedDbConfig::new(4, 8);
        cfg.num_data_pages = 32;
        cfg.params = params;
        cfg.bitmap_size = if params.contains(Params::USE_INDEX) { 2 } else { 0 };
        cfg.layout()
    }

    #[test]
    fn header_round_trip() {
        let layout = layout_with(Params::empty());
        let mut page = [0u8; 512];
        layout.set_page_id(&mut page, 0xDEAD_BEEF);
        layout.set_record_count(&mut page, 17);
        assert_eq!(layout.page_id(&page), 0xDEAD_BEEF);
        assert_eq!(layout.record_count(&page), 17);
    }

    #[test]
    fn records_start_after_header() {
        let layout = layout_with(Params::USE_MAX_MIN);
        assert_eq!(layout.header_size, 6 + 8 + 16);
        let mut page = [0u8; 512];
        let rec = layout.record_mut(&mut page, 0);
        key_to_bytes(&mut rec[..4], 42);
        assert_eq!(layout.record_key(&page, 0), 42);
        assert_eq!(layout.first_key(&page), 42);
    }

    #[test]
    fn sentinels_fill_min_regions() {
        let layout = layout_with(Params::USE_MAX_MIN);
        let mut page = [0u8; 512];
        layout.init_page(&mut page, true);
        assert_eq!(layout.header_min_key(&page), 0xFFFF_FFFF);
        assert!(layout.header_min_data(&page).iter().all(|&b| b == 0xFF));
        assert!(layout.header_max_data(&page).iter().all(|&b| b == 0));
    }

    #[test]
    fn bitmap_sits_between_count_and_minmax() {
        let layout = layout_with(Params::USE_INDEX | Params::USE_BITMAP | Params::USE_MAX_MIN);
        assert_eq!(layout.header_size, 6 + 2 + 8 + 16);
        let mut page = [0u8; 512];
        layout.bitmap_mut(&mut page).fill(0xAA);
        assert_eq!(&page[6..8], &[0xAA, 0xAA]);
        layout.set_header_min_key(&mut page, 7);
        assert_eq!(layout.header_min_key(&page), 7);
    }

    #[test]
    fn pool_copy_between_slots() {
        let mut pool = BufferPool::new(64, 3);
        pool.page_mut(0)[10] = 0x5A;
        pool.copy_page(0, 2);
        assert_eq!(pool.page(2)[10], 0x5A);

        pool.page_mut(1).fill(0);
        pool.copy_between(2, 10, 1, 0, 1);
        assert_eq!(pool.page(1)[0], 0x5A);
    }

    #[test]
    fn key_codec_is_little_endian() {
        let mut bytes = [0u8; 3];
        key_to_bytes(&mut bytes, 0x01_02_03);
        assert_eq!(bytes, [0x03, 0x02, 0x01]);
        assert_eq!(key_from_bytes(&bytes), 0x01_02_03);
    }
}
