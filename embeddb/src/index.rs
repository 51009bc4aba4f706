//! Secondary index file
//!
//! Each written data page contributes its header bitmap to the current
//! index-write page; a full index page goes to the index ring. Iterators use
//! the stored bitmaps to skip data pages that cannot satisfy a query. Index
//! page header: 4-byte id, 2-byte count, 2 unused, 4-byte id of the first
//! data page summarized, 4 bytes reserved for the last.

use embeddb_block_device::StorageDevice;

use crate::buffer::{DATA_WRITE_BUFFER, INDEX_READ_BUFFER, INDEX_WRITE_BUFFER};
use crate::config::IDX_HEADER_SIZE;
use crate::db::EmbedDb;
use crate::error::Error;

impl<D: StorageDevice> EmbedDb<D> {
    pub(crate) async fn init_index(&mut self) -> Result<(), Error<D::Error>> {
        self.init_buffer_page(INDEX_WRITE_BUFFER);
        let layout = self.layout;
        let next = self.next_data_page_id;
        layout.set_idx_first_data_page(self.pool.page_mut(INDEX_WRITE_BUFFER), next);

        self.next_idx_page_id = 0;
        self.min_index_page_id = 0;
        self.avail_index_pages = self.cfg.num_index_pages as i32;

        if self.cfg.reset_on_open() {
            let end = self.cfg.num_index_pages;
            if let Some(dev) = self.storage.index.as_mut() {
                dev.erase_pages(0, end).await?;
            }
            return Ok(());
        }
        self.recover_index().await
    }

    /// Load a physical index page into the index read buffer.
    pub(crate) async fn read_index_page(&mut self, phys: u32) -> Result<(), Error<D::Error>> {
        if self.buffered_index_page_id == Some(phys) {
            self.stats.buffer_hits += 1;
            return Ok(());
        }
        let dev = self.storage.index.as_mut().ok_or(Error::InvalidInput)?;
        dev.read_page(phys, self.pool.page_mut(INDEX_READ_BUFFER))
            .await?;
        self.stats.num_idx_reads += 1;
        self.buffered_index_page_id = Some(phys);
        Ok(())
    }

    pub(crate) async fn try_read_index_page(&mut self, phys: u32) -> bool {
        if phys >= self.cfg.num_index_pages {
            return false;
        }
        self.read_index_page(phys).await.is_ok()
    }

    /// Write the index write buffer as the next index page.
    pub(crate) async fn write_index_page(&mut self) -> Result<u32, Error<D::Error>> {
        let num = self.cfg.num_index_pages;
        let erase = self.cfg.erase_size_in_pages;
        let page_num = self.next_idx_page_id;
        self.next_idx_page_id += 1;
        let phys = page_num % num;

        let layout = self.layout;
        layout.set_page_id(self.pool.page_mut(INDEX_WRITE_BUFFER), page_num);

        let dev = self.storage.index.as_mut().ok_or(Error::InvalidInput)?;
        if self.avail_index_pages <= 0 {
            dev.erase_pages(phys, phys + erase).await?;
            if let Some(b) = self.buffered_index_page_id {
                if b >= phys && b < phys + erase {
                    self.buffered_index_page_id = None;
                }
            }
            self.avail_index_pages += erase as i32;
            self.min_index_page_id += erase;
        }

        let dev = self.storage.index.as_mut().ok_or(Error::InvalidInput)?;
        dev.write_page(phys, self.pool.page(INDEX_WRITE_BUFFER))
            .await?;
        if self.buffered_index_page_id == Some(phys) {
            self.buffered_index_page_id = None;
        }
        self.avail_index_pages -= 1;
        self.stats.num_idx_writes += 1;
        Ok(page_num)
    }

    /// Copy the just-written data page's bitmap into the index write buffer.
    pub(crate) fn stage_index_bitmap(&mut self) {
        let layout = self.layout;
        let idx = layout.record_count(self.pool.page(INDEX_WRITE_BUFFER)) as usize;
        layout.inc_record_count(self.pool.page_mut(INDEX_WRITE_BUFFER));
        self.pool.copy_between(
            DATA_WRITE_BUFFER,
            6,
            INDEX_WRITE_BUFFER,
            IDX_HEADER_SIZE + idx * layout.bitmap_size,
            layout.bitmap_size,
        );
    }

    /// Record the bitmap of data page `page_num`, flushing the index write
    /// buffer first if it is full.
    pub(crate) async fn append_index_record(
        &mut self,
        page_num: u32,
    ) -> Result<(), Error<D::Error>> {
        let layout = self.layout;
        let count = layout.record_count(self.pool.page(INDEX_WRITE_BUFFER));
        if count >= layout.max_idx_records_per_page {
            self.write_index_page().await?;
            self.init_buffer_page(INDEX_WRITE_BUFFER);
            layout.set_idx_first_data_page(self.pool.page_mut(INDEX_WRITE_BUFFER), page_num);
        }
        self.stage_index_bitmap();
        Ok(())
    }
}
