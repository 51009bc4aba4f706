//! Variable-length data store
//!
//! Blobs live in their own page ring, addressed by a 32-bit absolute offset
//! into the virtual `num_var_pages * page_size` byte space; the fixed record
//! stores that offset (or [`NO_VAR_DATA`]). A blob is a 4-byte length prefix
//! followed by the payload, sliced across page boundaries; every page starts
//! with a header carrying the page id and the largest key stored on it, so
//! wrap-around reclamation knows which keys it destroys.

use embeddb_block_device::StorageDevice;

use crate::buffer::{DATA_READ_BUFFER, DATA_WRITE_BUFFER};
use crate::db::EmbedDb;
use crate::error::Error;

/// Sentinel offset: the record has no variable data. Constrains the
/// variable arena to less than 2^32 - 1 bytes.
pub(crate) const NO_VAR_DATA: u32 = u32::MAX;

/// Forward-only cursor over one variable-length record, possibly spanning
/// several pages.
#[derive(Debug, Clone)]
pub struct VarDataStream {
    /// Virtual byte offset of the payload start.
    data_start: u32,
    /// Payload length in bytes.
    total_bytes: u32,
    bytes_read: u32,
    file_offset: u32,
}

impl VarDataStream {
    /// Payload length in bytes.
    pub fn len(&self) -> u32 {
        self.total_bytes
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> u32 {
        self.total_bytes - self.bytes_read
    }

    /// Rewind to the payload start.
    pub fn reset(&mut self) {
        self.bytes_read = 0;
        self.file_offset = self.data_start;
    }
}

/// Outcome of a variable-data lookup.
#[derive(Debug)]
pub enum VarRecord {
    /// The record exists but carries no variable data.
    None,
    /// The record's variable data was reclaimed by ring wrap.
    Overwritten,
    /// The variable data is readable through the stream.
    Stream(VarDataStream),
}

impl<D: StorageDevice> EmbedDb<D> {
    pub(crate) async fn init_var(&mut self) -> Result<(), Error<D::Error>> {
        let slot = self.cfg.var_write_slot();
        self.init_buffer_page(slot);

        self.current_var_loc = self.layout.var_header_size as u32;
        self.min_var_record_id = u64::MAX;
        self.next_var_page_id = 0;
        self.avail_var_pages = self.cfg.num_var_pages as i32;

        if self.cfg.reset_on_open() {
            let end = self.cfg.num_var_pages;
            if let Some(dev) = self.storage.var.as_mut() {
                dev.erase_pages(0, end).await?;
            }
            return Ok(());
        }
        if self.next_data_page_id > 0 || self.cfg.use_rlc() {
            self.recover_var().await
        } else {
            Ok(())
        }
    }

    /// Load a physical variable page into the variable read buffer.
    pub(crate) async fn read_var_page(&mut self, phys: u32) -> Result<(), Error<D::Error>> {
        if self.buffered_var_page_id == Some(phys) {
            self.stats.buffer_hits += 1;
            return Ok(());
        }
        let slot = self.cfg.var_read_slot();
        let dev = self.storage.var.as_mut().ok_or(Error::InvalidInput)?;
        dev.read_page(phys, self.pool.page_mut(slot)).await?;
        self.stats.num_reads += 1;
        self.buffered_var_page_id = Some(phys);
        Ok(())
    }

    pub(crate) async fn try_read_var_page(&mut self, phys: u32) -> bool {
        if phys >= self.cfg.num_var_pages {
            return false;
        }
        self.read_var_page(phys).await.is_ok()
    }

    /// Write the variable write buffer as the next variable page. A wrap
    /// erase reads the last reclaimed page first to learn which keys were
    /// destroyed.
    pub(crate) async fn write_var_page(&mut self) -> Result<u32, Error<D::Error>> {
        let layout = self.layout;
        let num = self.cfg.num_var_pages;
        let erase = self.cfg.erase_size_in_pages;
        let phys = self.next_var_page_id % num;

        if self.avail_var_pages <= 0 {
            // Everything up to the reclaimed block's largest key is gone.
            // Read the header before the erase destroys it.
            let last_reclaimed = (phys + erase - 1) % num;
            self.read_var_page(last_reclaimed).await?;
            let buf = self.pool.page(self.cfg.var_read_slot());
            self.min_var_record_id = layout.var_page_key(buf) + 1;
            self.buffered_var_page_id = None;

            let dev = self.storage.var.as_mut().ok_or(Error::InvalidInput)?;
            dev.erase_pages(phys, phys + erase).await?;
            self.avail_var_pages += erase as i32;
        }

        let slot = self.cfg.var_write_slot();
        let next_id = self.next_var_page_id;
        layout.set_page_id(self.pool.page_mut(slot), next_id);

        let dev = self.storage.var.as_mut().ok_or(Error::InvalidInput)?;
        dev.write_page(phys, self.pool.page(slot)).await?;
        if self.buffered_var_page_id == Some(phys) {
            self.buffered_var_page_id = None;
        }
        self.next_var_page_id += 1;
        self.avail_var_pages -= 1;
        self.stats.num_writes += 1;
        Ok(next_id)
    }

    /// Flush the variable write buffer, if it holds any record bytes, and
    /// advance the write cursor to a fresh page.
    pub async fn flush_var(&mut self) -> Result<(), Error<D::Error>> {
        if !self.cfg.use_vdata() {
            return Err(Error::InvalidInput);
        }
        let layout = self.layout;
        let page_size = self.cfg.page_size as u32;
        if self.current_var_loc % page_size == layout.var_header_size as u32 {
            return Ok(());
        }

        self.write_var_page().await?;
        let dev = self.storage.var.as_mut().ok_or(Error::InvalidInput)?;
        dev.flush().await?;

        let slot = self.cfg.var_write_slot();
        self.init_buffer_page(slot);
        let leftover = page_size - self.current_var_loc % page_size;
        self.current_var_loc = self
            .current_var_loc
            .wrapping_add(leftover + layout.var_header_size as u32);
        Ok(())
    }

    /// Append a record with an optional variable-length blob.
    pub async fn put_var(
        &mut self,
        key: u64,
        data: &[u8],
        var_data: Option<&[u8]>,
    ) -> Result<(), Error<D::Error>> {
        if !self.cfg.use_vdata() {
            error!("variable data is not enabled");
            return Err(Error::InvalidInput);
        }
        let layout = self.layout;
        let page_size = self.cfg.page_size as u32;
        let slot = self.cfg.var_write_slot();

        // The length prefix must fit in the current page, and without
        // record-level consistency the fixed page must not write mid-blob.
        let full_fixed_page = layout.record_count(self.pool.page(DATA_WRITE_BUFFER))
            >= layout.max_records_per_page;
        if self.current_var_loc % page_size > page_size - 4
            || (!self.cfg.use_rlc() && full_fixed_page)
        {
            self.write_var_page().await?;
            self.init_buffer_page(slot);
            let leftover = page_size - self.current_var_loc % page_size;
            self.current_var_loc = self
                .current_var_loc
                .wrapping_add(leftover + layout.var_header_size as u32);
        }

        let Some(mut remaining) = var_data else {
            self.record_has_var_data = false;
            return self.put(key, data).await;
        };

        self.record_has_var_data = true;
        let put_result = self.put(key, data).await;
        self.record_has_var_data = false;
        put_result?;

        if self.min_var_record_id == u64::MAX {
            self.min_var_record_id = key;
        }

        // This page now holds data for `key`.
        layout.set_var_page_key(self.pool.page_mut(slot), key);

        let at = (self.current_var_loc % page_size) as usize;
        let len = remaining.len() as u32;
        self.pool.page_mut(slot)[at..at + 4].copy_from_slice(&len.to_le_bytes());
        self.current_var_loc = self.current_var_loc.wrapping_add(4);

        if self.current_var_loc % page_size == 0 {
            self.write_var_page().await?;
            self.init_buffer_page(slot);
            layout.set_var_page_key(self.pool.page_mut(slot), key);
            self.current_var_loc = self
                .current_var_loc
                .wrapping_add(layout.var_header_size as u32);
        }

        while !remaining.is_empty() {
            let at = (self.current_var_loc % page_size) as usize;
            let space = self.cfg.page_size - at;
            let amt = space.min(remaining.len());
            self.pool.page_mut(slot)[at..at + amt].copy_from_slice(&remaining[..amt]);
            remaining = &remaining[amt..];
            self.current_var_loc = self.current_var_loc.wrapping_add(amt as u32);

            if self.current_var_loc % page_size == 0 {
                self.write_var_page().await?;
                self.init_buffer_page(slot);
                layout.set_var_page_key(self.pool.page_mut(slot), key);
                self.current_var_loc = self
                    .current_var_loc
                    .wrapping_add(layout.var_header_size as u32);
            }
        }

        if self.cfg.use_rlc() {
            self.flush_var().await?;
        }
        Ok(())
    }

    /// Build a stream for the variable data of the record at `slot` of the
    /// data read buffer.
    pub(crate) async fn setup_var_stream(
        &mut self,
        key: u64,
        slot: usize,
    ) -> Result<VarRecord, Error<D::Error>> {
        let layout = self.layout;
        let page_size = self.cfg.page_size as u32;
        let arena = self.cfg.num_var_pages * page_size;

        let var_offset = layout.record_var_offset(self.pool.page(DATA_READ_BUFFER), slot);
        if var_offset == NO_VAR_DATA {
            return Ok(VarRecord::None);
        }
        if key < self.min_var_record_id {
            return Ok(VarRecord::Overwritten);
        }

        let page = (var_offset / page_size) % self.cfg.num_var_pages;
        self.read_var_page(page).await?;

        let buf = self.pool.page(self.cfg.var_read_slot());
        let at = (var_offset % page_size) as usize;
        let total_bytes = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());

        // Step over the length prefix, and over the next page's header if
        // the prefix ended the page.
        let mut data_addr = (var_offset + 4) % arena;
        if data_addr % page_size == 0 {
            data_addr = (data_addr + layout.var_header_size as u32) % arena;
        }

        Ok(VarRecord::Stream(VarDataStream {
            data_start: data_addr,
            total_bytes,
            bytes_read: 0,
            file_offset: data_addr,
        }))
    }

    /// Look up `key`, copying its fixed data into `data` and returning the
    /// state of its variable data.
    pub async fn get_var(
        &mut self,
        key: u64,
        data: &mut [u8],
    ) -> Result<VarRecord, Error<D::Error>> {
        if !self.cfg.use_vdata() {
            error!("variable data is not enabled");
            return Err(Error::InvalidInput);
        }
        if data.len() != self.layout.data_size {
            return Err(Error::InvalidInput);
        }

        let slot = if let Some(slot) = self.search_write_buffer(key, data) {
            // The record is still in the write buffer: push the variable
            // bytes to storage and stage the buffer where the stream setup
            // reads records from.
            self.flush_var().await?;
            self.pool.copy_page(DATA_WRITE_BUFFER, DATA_READ_BUFFER);
            self.buffered_page_id = None;
            slot
        } else {
            self.get(key, data).await?;
            let buf = self.pool.page(DATA_READ_BUFFER);
            self.search_node(buf, key, false).ok_or(Error::NotFound)?
        };

        self.setup_var_stream(key, slot).await
    }

    /// Read up to `buf.len()` bytes from the stream, crossing page
    /// boundaries and skipping their headers. Returns the number of bytes
    /// read; 0 means the stream is exhausted.
    pub async fn var_stream_read(
        &mut self,
        stream: &mut VarDataStream,
        buf: &mut [u8],
    ) -> Result<usize, Error<D::Error>> {
        if !self.cfg.use_vdata() {
            return Err(Error::InvalidInput);
        }
        if stream.bytes_read >= stream.total_bytes || buf.is_empty() {
            return Ok(0);
        }
        let page_size = self.cfg.page_size as u32;
        let num = self.cfg.num_var_pages;
        let read_slot = self.cfg.var_read_slot();

        let mut page = (stream.file_offset / page_size) % num;
        self.read_var_page(page).await?;

        let mut amt_read = 0usize;
        while amt_read < buf.len() && stream.bytes_read < stream.total_bytes {
            let page_offset = (stream.file_offset % page_size) as usize;
            let amt = (stream.total_bytes - stream.bytes_read)
                .min((page_size as usize - page_offset) as u32)
                .min((buf.len() - amt_read) as u32) as usize;

            let src = self.pool.page(read_slot);
            buf[amt_read..amt_read + amt].copy_from_slice(&src[page_offset..page_offset + amt]);
            amt_read += amt;
            stream.bytes_read += amt as u32;
            stream.file_offset = stream.file_offset.wrapping_add(amt as u32);

            if amt_read < buf.len() && stream.bytes_read < stream.total_bytes {
                page = (page + 1) % num;
                self.read_var_page(page).await?;
                stream.file_offset = stream
                    .file_offset
                    .wrapping_add(self.layout.var_header_size as u32);
            }
        }
        Ok(amt_read)
    }
}
