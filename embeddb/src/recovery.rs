//! Recovery on open
//!
//! No manifest exists: every ring is reconstructed from page headers and the
//! ring invariants alone. A permanent page is recognized by its logical id
//! mapping back to the physical slot it occupies and a record count within
//! bounds; scanning tolerates erased leading blocks, follows the contiguous
//! run of ids to the log tail, and probes one block past the tail to detect
//! wrap. With record-level consistency the two-block scratch window is also
//! scanned for the newest temporary copy of the unfinished page.

use embeddb_block_device::StorageDevice;

use crate::buffer::{DATA_READ_BUFFER, DATA_WRITE_BUFFER};
use crate::db::EmbedDb;
use crate::error::Error;

impl<D: StorageDevice> EmbedDb<D> {
    /// Is the read buffer a valid permanent page for physical slot `slot`?
    fn permanent_page_at(&self, slot: u32) -> bool {
        let layout = self.layout;
        let buf = self.pool.page(DATA_READ_BUFFER);
        let count = layout.record_count(buf);
        layout.page_id(buf) % self.cfg.num_data_pages == slot
            && count > 0
            && count <= layout.max_records_per_page
    }

    /// Rebuild the data ring state from the device, without record-level
    /// consistency.
    pub(crate) async fn recover_data(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        let block = self.cfg.erase_size_in_pages;

        let mut max_logical = 0u32;
        let mut phys = 0u32;
        let mut count = 0u32;
        let mut has_data = false;

        let mut more = self.try_read_page(phys).await;

        // The first block may have been erased mid-write; tolerate one junk
        // block before the log starts.
        let mut i = 0;
        while more && i < 2 {
            if self.permanent_page_at(count) {
                has_data = true;
                max_logical = layout.page_id(self.pool.page(DATA_READ_BUFFER));
                phys += 1;
                self.note_page_error(DATA_READ_BUFFER);
                count += 1;
                i = 2;
            } else {
                phys += block;
                count += block;
            }
            more = self.try_read_page(phys).await;
            i += 1;
        }

        if !has_data {
            debug!("data ring is empty, starting fresh");
            return Ok(());
        }

        // Follow the contiguous run of logical ids to the log tail.
        while more && count < num {
            let buf = self.pool.page(DATA_READ_BUFFER);
            let logical = layout.page_id(buf);
            if logical % num == count && logical == max_logical + 1 {
                max_logical = logical;
                phys += 1;
                self.note_page_error(DATA_READ_BUFFER);
                more = self.try_read_page(phys).await;
                count += 1;
            } else {
                break;
            }
        }

        // Detect wrap: a valid page at the next block boundary means the
        // oldest data starts there, not at physical 0.
        let mut phys_smallest = 0u32;
        if more && count < num {
            let to_boundary = block - (count % block);
            phys = (phys + to_boundary) % num;
            more = self.try_read_page(phys).await;
            if !more {
                error!("data ring truncated inside a block during recovery");
                return Err(Error::CorruptedDatabase);
            }
            let logical = layout.page_id(self.pool.page(DATA_READ_BUFFER));
            if logical % num == phys {
                phys_smallest = phys;
            }
        }

        self.next_data_page_id = max_logical + 1;
        self.read_page(phys_smallest).await?;
        self.min_data_page_id = layout.page_id(self.pool.page(DATA_READ_BUFFER));
        self.avail_data_pages =
            (num as i64 + self.min_data_page_id as i64 - max_logical as i64 - 1) as i32;

        // Warm the read buffer with the log tail; the next put compares
        // against its last key.
        self.read_page((self.next_data_page_id - 1) % num).await?;

        if self.cfg.use_spline() {
            self.recover_spline().await?;
        }
        debug!(
            "recovered data ring: pages {}..{}",
            self.min_data_page_id, self.next_data_page_id
        );
        Ok(())
    }

    /// Rebuild the data ring state with record-level consistency: locate the
    /// permanent log, then the newest temporary page in the scratch window.
    pub(crate) async fn recover_data_rlc(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        let block = self.cfg.erase_size_in_pages;

        let mut max_logical = 0u32;
        let mut phys = 0u32;
        let mut count = 0u32;
        let mut has_permanent = false;

        let mut more = self.try_read_page(phys).await;

        // Up to three leading blocks may be junk: an interrupted erase plus
        // the rotating scratch window itself.
        let mut i = 0;
        while more && i < 4 {
            if self.permanent_page_at(count) {
                has_permanent = true;
                max_logical = layout.page_id(self.pool.page(DATA_READ_BUFFER));
                phys += 1;
                self.note_page_error(DATA_READ_BUFFER);
                count += 1;
                i = 4;
            } else {
                phys += block;
                count += block;
            }
            more = self.try_read_page(phys).await;
            i += 1;
        }

        if has_permanent {
            while more && count < num {
                let buf = self.pool.page(DATA_READ_BUFFER);
                let logical = layout.page_id(buf);
                if logical % num == count && logical == max_logical + 1 {
                    max_logical = logical;
                    phys += 1;
                    self.note_page_error(DATA_READ_BUFFER);
                    more = self.try_read_page(phys).await;
                    count += 1;
                } else {
                    break;
                }
            }
        } else {
            // No permanent log; the scratch window may still hold records.
            count = 0;
            phys = 0;
        }

        // If the log ends exactly on a block boundary, re-erase the next
        // block in case its erase was the operation that was interrupted.
        let to_boundary = block - (count % block);
        if to_boundary == block {
            self.storage
                .data
                .erase_pages(count % num, count % num + block)
                .await?;
            self.invalidate_buffered_data(count % num, count % num + block);
        }

        phys = (phys + to_boundary) % num;
        self.rlc_start_page = phys;
        self.next_rlc_page = phys;

        // Scan the two-block window for the temporary page continuing the
        // log (id = tail + 1) with the highest record count.
        let pages_to_read = block * 2;
        let mut pages_read = 0u32;
        let mut best_count = u32::MAX;
        let mut best_window_offset = u32::MAX;
        more = self.try_read_page(phys).await;
        while more && pages_read < pages_to_read {
            let buf = self.pool.page(DATA_READ_BUFFER);
            let logical = layout.page_id(buf);
            if logical == max_logical + 1 || (logical == 0 && !has_permanent) {
                let records = layout.record_count(buf) as u32;
                if best_count == u32::MAX || records > best_count {
                    best_count = records;
                    best_window_offset = pages_read;
                }
            }
            phys = (phys + 1) % num;
            more = self.try_read_page(phys).await;
            pages_read += 1;
        }

        // Restore the newest temporary page (if any) as the write buffer and
        // erase whatever of the window is no longer needed.
        let mut erase_start;
        let blocks_to_erase;
        if best_window_offset == u32::MAX {
            erase_start = self.rlc_start_page % num;
            blocks_to_erase = 2;
        } else {
            self.next_rlc_page = (self.rlc_start_page + best_window_offset + 1) % num;
            let best_phys = (self.rlc_start_page + best_window_offset) % num;
            self.read_page(best_phys).await?;
            self.pool.copy_page(DATA_READ_BUFFER, DATA_WRITE_BUFFER);
            debug!(
                "restored temporary page with {} records from physical page {}",
                best_count, best_phys
            );
            erase_start = (self.rlc_start_page + if best_window_offset < block { block } else { 0 })
                % num;
            blocks_to_erase = 1;
        }
        for _ in 0..blocks_to_erase {
            let erase_end = erase_start + block;
            self.storage.data.erase_pages(erase_start, erase_end).await?;
            self.invalidate_buffered_data(erase_start, erase_end);
            erase_start = erase_end % num;
        }

        if !has_permanent {
            debug!("no permanent pages; scratch window at physical page {}", self.rlc_start_page);
            return Ok(());
        }

        // Wrap detection, one block past the scratch window.
        let mut phys_smallest = 0u32;
        let probe = (self.rlc_start_page + 2 * block) % num;
        if self.try_read_page(probe).await {
            let logical = layout.page_id(self.pool.page(DATA_READ_BUFFER));
            if logical % num == probe {
                phys_smallest = probe;
            }
        }

        self.next_data_page_id = max_logical + 1;
        self.read_page(phys_smallest).await?;
        self.min_data_page_id = layout.page_id(self.pool.page(DATA_READ_BUFFER));
        self.avail_data_pages = (num as i64 + self.min_data_page_id as i64
            - max_logical as i64
            - 1
            - (2 * block) as i64) as i32;

        self.read_page((self.next_data_page_id - 1) % num).await?;
        if self.cfg.use_spline() {
            self.recover_spline().await?;
        }
        debug!(
            "recovered data ring: pages {}..{}, scratch window at {}",
            self.min_data_page_id, self.next_data_page_id, self.rlc_start_page
        );
        Ok(())
    }

    /// Re-seed the spline from the first key of every permanent page.
    pub(crate) async fn recover_spline(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_data_pages;
        for page_num in self.min_data_page_id..self.next_data_page_id {
            self.read_page(page_num % num).await?;
            let key = layout.first_key(self.pool.page(DATA_READ_BUFFER));
            if let Some(spl) = self.spline.as_mut() {
                spl.add(key, page_num);
            }
        }
        Ok(())
    }

    /// Rebuild the index ring state from the device.
    pub(crate) async fn recover_index(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_index_pages;

        let mut max_logical = 0u32;
        let mut phys = 0u32;
        let mut count = 0u32;
        let mut last_logical = 0u32;
        let mut wrapped = false;

        let mut more = self.try_read_index_page(phys).await;
        while more && count < num {
            let buf = self.pool.page(crate::buffer::INDEX_READ_BUFFER);
            let logical = layout.page_id(buf);
            if logical % num == count && (count == 0 || logical == max_logical + 1) {
                max_logical = logical;
                phys += 1;
                more = self.try_read_index_page(phys).await;
                count += 1;
            } else {
                last_logical = logical;
                wrapped = logical == max_logical.wrapping_add(1).wrapping_sub(num);
                break;
            }
        }

        if count == 0 {
            return Ok(());
        }

        self.next_idx_page_id = max_logical + 1;
        let phys_smallest = if wrapped { last_logical % num } else { 0 };
        self.read_index_page(phys_smallest).await?;
        self.min_index_page_id = layout.page_id(self.pool.page(crate::buffer::INDEX_READ_BUFFER));
        self.avail_index_pages =
            (num as i64 + self.min_index_page_id as i64 - max_logical as i64 - 1) as i32;

        // The fresh index write buffer summarizes pages from the log tail on.
        let next = self.next_data_page_id;
        layout.set_idx_first_data_page(
            self.pool.page_mut(crate::buffer::INDEX_WRITE_BUFFER),
            next,
        );
        Ok(())
    }

    /// Rebuild the variable-data ring state from the device.
    pub(crate) async fn recover_var(&mut self) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_var_pages;
        let block = self.cfg.erase_size_in_pages;
        let read_slot = self.cfg.var_read_slot();
        let page_size = self.cfg.page_size as u32;

        let mut max_logical = 0u32;
        let mut phys = 0u32;
        let mut count = 0u32;
        let mut has_data = false;

        let mut more = self.try_read_var_page(phys).await;

        let mut i = 0;
        while more && i < 2 {
            let buf = self.pool.page(read_slot);
            let logical = layout.page_id(buf);
            if logical % num == count {
                // Page 0 with key 0 is indistinguishable from a zeroed
                // page; let the next page decide.
                let largest_key = layout.var_page_key(buf);
                if logical != 0 || largest_key != 0 {
                    i = 2;
                    has_data = true;
                    max_logical = logical;
                }
                phys += 1;
                count += 1;
            } else {
                let to_boundary = block - (count % block);
                phys += to_boundary;
                count += to_boundary;
                i += 1;
            }
            more = self.try_read_var_page(phys).await;
        }

        if !has_data {
            return Ok(());
        }

        while more && count < num {
            let buf = self.pool.page(read_slot);
            let logical = layout.page_id(buf);
            if logical % num == count && logical == max_logical + 1 {
                max_logical = logical;
                phys += 1;
                more = self.try_read_var_page(phys).await;
                count += 1;
            } else {
                break;
            }
        }

        let mut phys_smallest = 0u32;
        if more && count < num {
            let to_boundary = block - (count % block);
            phys = (phys + to_boundary) % num;
            more = self.try_read_var_page(phys).await;
            if !more {
                error!("variable ring truncated inside a block during recovery");
                return Err(Error::CorruptedDatabase);
            }
            let logical = layout.page_id(self.pool.page(read_slot));
            if logical % num == phys {
                phys_smallest = phys;
            }
        }

        self.next_var_page_id = max_logical + 1;
        self.read_var_page(phys_smallest).await?;
        let min_var_page_id = layout.page_id(self.pool.page(read_slot));

        if min_var_page_id == 0 {
            // Nothing was reclaimed yet: every key from the oldest fixed
            // record on still has its variable data.
            let min_key = if self.cfg.use_rlc() && self.next_data_page_id == 0 {
                layout.first_key(self.pool.page(DATA_WRITE_BUFFER))
            } else {
                self.read_page(self.min_data_page_id % self.cfg.num_data_pages)
                    .await?;
                layout.first_key(self.pool.page(DATA_READ_BUFFER))
            };
            self.min_var_record_id = min_key;
        } else {
            // Some records are gone; everything above the reclaimed page's
            // largest key is known to survive.
            self.min_var_record_id = layout.var_page_key(self.pool.page(read_slot)) + 1;
        }

        self.avail_var_pages =
            (num as i64 + min_var_page_id as i64 - max_logical as i64 - 1) as i32;
        self.current_var_loc =
            self.next_var_page_id % num * page_size + layout.var_header_size as u32;
        debug!(
            "recovered variable ring: pages {}..{}, oldest var key {}",
            min_var_page_id, self.next_var_page_id, self.min_var_record_id
        );
        Ok(())
    }
}
