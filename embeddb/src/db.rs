//! Engine state and the write path
//!
//! [`EmbedDb`] owns the storage devices, the buffer pool, and the three page
//! rings (data, index, variable data). Records append through the data write
//! buffer; a full buffer becomes a permanent page, feeds the spline, and
//! optionally an index-file bitmap. With record-level consistency every
//! `put` additionally copies the partial page into a rotating scratch window
//! so a power loss costs at most the in-flight record.

use core::cmp::Ordering;

use embeddb_block_device::StorageDevice;

use crate::buffer::{
    BufferPool, DATA_READ_BUFFER, DATA_WRITE_BUFFER, INDEX_WRITE_BUFFER, key_to_bytes,
};
use crate::config::{EmbedDbConfig, Layout};
use crate::error::Error;
use crate::spline::Spline;
use crate::vardata::NO_VAR_DATA;

/// The set of storage devices backing one database: a data file, plus an
/// index file and a variable-data file when those subsystems are enabled.
///
/// [`EmbedDb::close`] hands the devices back so a database can be reopened
/// (or inspected) without reconstructing them.
pub struct Storage<D> {
    /// Device holding the data page ring.
    pub data: D,
    /// Device holding the index page ring, with `USE_INDEX`.
    pub index: Option<D>,
    /// Device holding the variable-data page ring, with `USE_VDATA`.
    pub var: Option<D>,
}

impl<D> Storage<D> {
    /// Storage for a plain database with neither index nor variable data.
    pub fn data_only(data: D) -> Self {
        Self {
            data,
            index: None,
            var: None,
        }
    }
}

/// Operation counters, reset via [`EmbedDb::reset_stats`].
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    /// Data and variable pages read from the device.
    pub num_reads: u32,
    /// Data and variable pages written to the device.
    pub num_writes: u32,
    /// Page reads satisfied by a read buffer.
    pub buffer_hits: u32,
    /// Index pages read from the device.
    pub num_idx_reads: u32,
    /// Index pages written to the device.
    pub num_idx_writes: u32,
}

/// An append-only time-series key-value store over page-granular storage.
pub struct EmbedDb<D: StorageDevice> {
    pub(crate) cfg: EmbedDbConfig,
    pub(crate) layout: Layout,
    pub(crate) storage: Storage<D>,
    pub(crate) pool: BufferPool,
    pub(crate) spline: Option<Spline>,

    /// Next logical data page id to assign.
    pub(crate) next_data_page_id: u32,
    /// Oldest logical data page id still valid.
    pub(crate) min_data_page_id: u32,
    /// Pages writable before an erase is needed; may be driven to zero.
    pub(crate) avail_data_pages: i32,

    pub(crate) next_idx_page_id: u32,
    pub(crate) min_index_page_id: u32,
    pub(crate) avail_index_pages: i32,

    pub(crate) next_var_page_id: u32,
    pub(crate) avail_var_pages: i32,
    /// Write cursor into the virtual variable-data byte space.
    pub(crate) current_var_loc: u32,
    /// Smallest key whose variable data is still on the ring; `u64::MAX`
    /// until the first variable record.
    pub(crate) min_var_record_id: u64,
    /// Whether the record being inserted by `put_var` carries a blob.
    pub(crate) record_has_var_data: bool,

    /// First physical page of the rotating record-level-consistency window.
    pub(crate) rlc_start_page: u32,
    /// Physical page the next temporary copy goes to.
    pub(crate) next_rlc_page: u32,

    /// Largest in-page linear-estimate error seen; seeds search windows.
    pub(crate) max_error: i32,

    pub(crate) buffered_page_id: Option<u32>,
    pub(crate) buffered_index_page_id: Option<u32>,
    pub(crate) buffered_var_page_id: Option<u32>,

    pub(crate) stats: Stats,
}

impl<D: StorageDevice> EmbedDb<D> {
    /// Open a database over `storage`, recovering any state already on the
    /// devices unless `RESET_ON_OPEN` is set.
    pub async fn init(cfg: EmbedDbConfig, storage: Storage<D>) -> Result<Self, Error<D::Error>> {
        cfg.validate().map_err(Error::InvalidConfiguration)?;
        if cfg.use_index() && storage.index.is_none() {
            return Err(Error::InvalidConfiguration("no index device provided"));
        }
        if cfg.use_vdata() && storage.var.is_none() {
            return Err(Error::InvalidConfiguration("no variable data device provided"));
        }

        let layout = cfg.layout();
        let pool = BufferPool::new(cfg.page_size, cfg.buffer_size_in_blocks as usize);
        let spline = if cfg.use_spline() {
            Some(Spline::new(cfg.num_spline_points, cfg.index_max_error))
        } else {
            None
        };

        let mut db = Self {
            layout,
            storage,
            pool,
            spline,
            next_data_page_id: 0,
            min_data_page_id: 0,
            avail_data_pages: 0,
            next_idx_page_id: 0,
            min_index_page_id: 0,
            avail_index_pages: 0,
            next_var_page_id: 0,
            avail_var_pages: 0,
            current_var_loc: 0,
            min_var_record_id: u64::MAX,
            record_has_var_data: false,
            rlc_start_page: 0,
            next_rlc_page: 0,
            max_error: layout.max_records_per_page as i32,
            buffered_page_id: None,
            buffered_index_page_id: None,
            buffered_var_page_id: None,
            stats: Stats::default(),
            cfg,
        };

        db.init_buffer_page(DATA_WRITE_BUFFER);
        db.init_data().await?;
        if db.cfg.use_index() {
            db.init_index().await?;
        }
        if db.cfg.use_vdata() {
            db.init_var().await?;
        }

        debug!(
            "embeddb open: page_size={} key_size={} data_size={} record_size={} records/page={} header={} sum={}",
            db.cfg.page_size,
            db.cfg.key_size,
            db.cfg.data_size,
            db.layout.record_size,
            db.layout.max_records_per_page,
            db.layout.header_size,
            db.cfg.params.contains(crate::Params::USE_SUM),
        );
        Ok(db)
    }

    async fn init_data(&mut self) -> Result<(), Error<D::Error>> {
        self.next_data_page_id = 0;
        self.min_data_page_id = 0;
        self.avail_data_pages = self.cfg.num_data_pages as i32;

        if self.cfg.use_rlc() {
            self.avail_data_pages -= (self.cfg.erase_size_in_pages * 2) as i32;
            self.rlc_start_page = self.cfg.erase_size_in_pages;
            self.next_rlc_page = self.cfg.erase_size_in_pages;
        }

        if self.cfg.reset_on_open() {
            let end = self.cfg.num_data_pages;
            self.storage.data.erase_pages(0, end).await?;
            return Ok(());
        }
        if self.cfg.use_rlc() {
            self.recover_data_rlc().await
        } else {
            self.recover_data().await
        }
    }

    /// Zero a buffer slot; data pages get their 0xFF min sentinels. The
    /// variable write buffer is plain bytes after its header and stays
    /// all-zero.
    pub(crate) fn init_buffer_page(&mut self, slot: usize) {
        let sentinels = !(self.cfg.use_vdata() && slot == self.cfg.var_write_slot());
        let layout = self.layout;
        layout.init_page(self.pool.page_mut(slot), sentinels);
    }

    /// Load a physical data page into the read buffer, unless it is already
    /// there.
    pub(crate) async fn read_page(&mut self, phys: u32) -> Result<(), Error<D::Error>> {
        if self.buffered_page_id == Some(phys) {
            self.stats.buffer_hits += 1;
            return Ok(());
        }
        self.storage
            .data
            .read_page(phys, self.pool.page_mut(DATA_READ_BUFFER))
            .await?;
        self.stats.num_reads += 1;
        self.buffered_page_id = Some(phys);
        Ok(())
    }

    /// Recovery-scan read: a failure means "nothing (more) here".
    pub(crate) async fn try_read_page(&mut self, phys: u32) -> bool {
        if phys >= self.cfg.num_data_pages {
            return false;
        }
        self.read_page(phys).await.is_ok()
    }

    /// Write the data write buffer as the next permanent page, erasing ahead
    /// of the ring head when the ring is full. Returns the logical page id.
    pub(crate) async fn write_data_page(&mut self) -> Result<u32, Error<D::Error>> {
        let num = self.cfg.num_data_pages;
        let erase = self.cfg.erase_size_in_pages;
        let page_num = self.next_data_page_id;
        self.next_data_page_id += 1;
        let phys = page_num % num;

        let layout = self.layout;
        layout.set_page_id(self.pool.page_mut(DATA_WRITE_BUFFER), page_num);

        if self.avail_data_pages <= 0 {
            self.storage.data.erase_pages(phys, phys + erase).await?;
            self.invalidate_buffered_data(phys, phys + erase);
            self.avail_data_pages += erase as i32;
            self.min_data_page_id += erase;
            if self.cfg.spline_clean_enabled() {
                if let Some(spl) = self.spline.as_mut() {
                    spl.clean(self.min_data_page_id);
                }
            }
        }

        self.storage
            .data
            .write_page(phys, self.pool.page(DATA_WRITE_BUFFER))
            .await?;
        if self.buffered_page_id == Some(phys) {
            self.buffered_page_id = None;
        }
        self.avail_data_pages -= 1;
        self.stats.num_writes += 1;
        Ok(page_num)
    }

    pub(crate) fn invalidate_buffered_data(&mut self, from: u32, to: u32) {
        if let Some(b) = self.buffered_page_id {
            if b >= from && b < to {
                self.buffered_page_id = None;
            }
        }
    }

    /// Record a freshly written page in the spline, keyed by its first key.
    pub(crate) fn note_page_indexed(&mut self, page_num: u32) {
        let layout = self.layout;
        let key = layout.first_key(self.pool.page(DATA_WRITE_BUFFER));
        if let Some(spl) = self.spline.as_mut() {
            spl.add(key, page_num);
        }
    }

    /// Slope of the keys on a page, in key units per record slot.
    pub(crate) fn page_slope(layout: Layout, buf: &[u8]) -> f32 {
        let count = layout.record_count(buf);
        if count <= 1 {
            return 1.0;
        }
        let first = layout.record_key(buf, 0);
        let last = layout.record_key(buf, count as usize - 1);
        (last - first) as f32 / (count - 1) as f32
    }

    /// Largest deviation between a record's slot and its linear estimate.
    pub(crate) fn page_max_error(&self, buf: &[u8]) -> i32 {
        let layout = self.layout;
        let count = layout.record_count(buf) as i32;
        if count <= 0 {
            return 0;
        }
        let min_key = layout.first_key(buf);
        let slope = Self::page_slope(layout, buf);
        let mut max_err = 0i32;
        for i in 0..count {
            let rel = (layout.record_key(buf, i as usize) - min_key) as f32;
            let est = rel / slope;
            let err = if est >= i as f32 {
                (est - i as f32) as i32
            } else {
                (i as f32 - est) as i32
            };
            if err > max_err {
                max_err = err;
            }
        }
        max_err.min(layout.max_records_per_page as i32)
    }

    /// Fold a page's error into the global search window.
    pub(crate) fn note_page_error(&mut self, slot: usize) {
        let err = self.page_max_error(self.pool.page(slot));
        if err > self.max_error {
            self.max_error = err;
        }
    }

    /// Append a record. The key must strictly exceed every previously
    /// inserted key.
    pub async fn put(&mut self, key: u64, data: &[u8]) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        if data.len() != layout.data_size {
            return Err(Error::InvalidInput);
        }

        let mut count = layout.record_count(self.pool.page(DATA_WRITE_BUFFER)) as usize;

        if self.next_data_page_id > 0 || count > 0 {
            let previous_key = if count == 0 {
                let phys = (self.next_data_page_id - 1) % self.cfg.num_data_pages;
                self.read_page(phys).await?;
                layout.last_key(self.pool.page(DATA_READ_BUFFER))
            } else {
                layout.record_key(self.pool.page(DATA_WRITE_BUFFER), count - 1)
            };
            if key <= previous_key {
                error!("keys must be strictly ascending, insert of {} failed", key);
                return Err(Error::KeyOrder);
            }
        }

        let mut wrote_page = false;
        if count >= layout.max_records_per_page as usize {
            let page_num = self.write_data_page().await?;
            self.note_page_indexed(page_num);
            if self.cfg.use_index() {
                self.append_index_record(page_num).await?;
            }
            self.note_page_error(DATA_WRITE_BUFFER);
            count = 0;
            self.init_buffer_page(DATA_WRITE_BUFFER);
            wrote_page = true;
        }

        let var_offset = if layout.use_vdata {
            if self.record_has_var_data {
                self.current_var_loc % (self.cfg.num_var_pages * self.cfg.page_size as u32)
            } else {
                NO_VAR_DATA
            }
        } else {
            0
        };

        let cmp = self.cfg.compare_data;
        let buf = self.pool.page_mut(DATA_WRITE_BUFFER);
        {
            let rec = layout.record_mut(buf, count);
            key_to_bytes(&mut rec[..layout.key_size], key);
            rec[layout.key_size..layout.key_size + layout.data_size].copy_from_slice(data);
            if layout.use_vdata {
                let at = layout.key_size + layout.data_size;
                rec[at..at + 4].copy_from_slice(&var_offset.to_le_bytes());
            }
        }
        layout.inc_record_count(buf);

        if layout.use_max_min {
            if count != 0 {
                // Keys ascend, so every insert moves max and never min.
                layout.set_header_max_key(buf, key);
                if cmp(data, layout.header_min_data(buf)) == Ordering::Less {
                    layout.header_min_data_mut(buf).copy_from_slice(data);
                }
                if cmp(data, layout.header_max_data(buf)) == Ordering::Greater {
                    layout.header_max_data_mut(buf).copy_from_slice(data);
                }
            } else {
                layout.set_header_min_key(buf, key);
                layout.set_header_max_key(buf, key);
                layout.header_min_data_mut(buf).copy_from_slice(data);
                layout.header_max_data_mut(buf).copy_from_slice(data);
            }
        }

        if self.cfg.use_bitmap() {
            if let Some(ops) = self.cfg.bitmap {
                (ops.update)(data, layout.bitmap_mut(buf));
            }
        }

        if self.cfg.use_rlc() {
            if wrote_page && self.next_data_page_id % self.cfg.erase_size_in_pages == 0 {
                self.shift_rlc_blocks().await?;
            }
            self.write_temporary_page().await?;
        }

        Ok(())
    }

    /// Write the (possibly partial) write buffer into the rotating
    /// record-level-consistency window under its prospective logical id.
    pub(crate) async fn write_temporary_page(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        let erase = self.cfg.erase_size_in_pages;

        let next_id = self.next_data_page_id;
        layout.set_page_id(self.pool.page_mut(DATA_WRITE_BUFFER), next_id);

        self.next_rlc_page %= num;

        // Wrap within the two-block window; compare in unwrapped space.
        let unwrapped = self.next_rlc_page
            + if self.next_rlc_page < self.rlc_start_page {
                num
            } else {
                0
            };
        if unwrapped - self.rlc_start_page >= erase * 2 {
            self.next_rlc_page = self.rlc_start_page;
        }

        // Entering the second page of a block: prepare the other block.
        if self.next_rlc_page % erase == 1 {
            let mut start = self.rlc_start_page;
            if self.next_rlc_page == start + 1 {
                start = (start + erase) % num;
            }
            self.storage.data.erase_pages(start, start + erase).await?;
            self.invalidate_buffered_data(start, start + erase);
        }

        let phys = self.next_rlc_page;
        self.storage
            .data
            .write_page(phys, self.pool.page(DATA_WRITE_BUFFER))
            .await?;
        self.next_rlc_page += 1;
        if self.buffered_page_id == Some(phys) {
            self.buffered_page_id = None;
        }
        Ok(())
    }

    /// Move the record-level-consistency window one erase block forward,
    /// reclaiming the oldest data block when the window catches the ring
    /// tail.
    pub(crate) async fn shift_rlc_blocks(&mut self) -> Result<(), Error<D::Error>> {
        let erase = self.cfg.erase_size_in_pages;
        let num = self.cfg.num_data_pages;
        let window = erase * 2;

        let have_wrapped =
            self.min_data_page_id % num == (self.rlc_start_page + window) % num;
        let blocks_to_erase = if have_wrapped { 2 } else { 3 };

        let mut start = self.rlc_start_page;
        for _ in 0..blocks_to_erase {
            let end = start + erase;
            self.storage.data.erase_pages(start, end).await?;
            self.invalidate_buffered_data(start, end);
            start = end % num;
        }

        if have_wrapped {
            self.avail_data_pages += erase as i32;
            self.min_data_page_id += erase;
            if self.cfg.spline_clean_enabled() {
                if let Some(spl) = self.spline.as_mut() {
                    spl.clean(self.min_data_page_id);
                }
            }
        }

        self.rlc_start_page = (self.rlc_start_page + erase) % num;
        self.next_rlc_page = self.rlc_start_page;
        Ok(())
    }

    /// Write out the partial data page (if any), the trailing index page,
    /// and the variable-data buffer.
    pub async fn flush(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        if layout.record_count(self.pool.page(DATA_WRITE_BUFFER)) >= 1 {
            let page_num = self.write_data_page().await?;
            self.storage.data.flush().await?;
            self.note_page_indexed(page_num);

            if self.cfg.use_index() {
                self.append_index_record(page_num).await?;
                self.write_index_page().await?;
                if let Some(dev) = self.storage.index.as_mut() {
                    dev.flush().await?;
                }
                self.init_buffer_page(INDEX_WRITE_BUFFER);
                let next = self.next_data_page_id;
                layout.set_idx_first_data_page(self.pool.page_mut(INDEX_WRITE_BUFFER), next);
            }

            self.note_page_error(DATA_WRITE_BUFFER);
            self.init_buffer_page(DATA_WRITE_BUFFER);
        }

        if self.cfg.use_vdata() {
            self.flush_var().await?;
        }
        Ok(())
    }

    /// Release the devices. Ring state stays on disk; an unflushed write
    /// buffer is lost unless record-level consistency preserved it.
    pub fn close(self) -> Storage<D> {
        self.storage
    }

    /// Operation counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Zero the operation counters.
    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Next logical data page id to be assigned.
    pub fn next_data_page(&self) -> u32 {
        self.next_data_page_id
    }

    /// Oldest logical data page id still retrievable.
    pub fn min_data_page(&self) -> u32 {
        self.min_data_page_id
    }

    /// Smallest key whose variable data is still on the ring, if any
    /// variable record was ever written.
    pub fn min_var_key(&self) -> Option<u64> {
        if !self.cfg.use_vdata() || self.min_var_record_id == u64::MAX {
            None
        } else {
            Some(self.min_var_record_id)
        }
    }

    /// Diagnostic view of the spline: `(estimated page, low, high)` for a
    /// key, or `None` when no spline points exist.
    pub fn spline_find(&self, key: u64) -> Option<(u32, u32, u32)> {
        let spl = self.spline.as_ref()?;
        if spl.len() == 0 {
            return None;
        }
        Some(spl.find(key))
    }

    /// Number of live spline points.
    pub fn spline_len(&self) -> usize {
        self.spline.as_ref().map_or(0, |spl| spl.len())
    }

    /// The `i`-th live spline point as `(key, page)`, oldest first.
    pub fn spline_point(&self, i: usize) -> Option<(u64, u32)> {
        let spl = self.spline.as_ref()?;
        if i >= spl.len() {
            return None;
        }
        let p = spl.point(i);
        Some((p.key, p.page))
    }
}
