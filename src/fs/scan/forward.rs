//! blocks in physical order, chunks first to last: a later copy replaces an
//! earlier one unless the serial numbers say it is older
use log::{debug, info, warn};

use crate::error::Result;
use crate::nand::{compare_serials, ExtendedTags, NandDriver, ObjectType, SerialOrder};

use super::super::block_info::BlockState;
use super::super::chunk_map::PutMode;
use super::super::config::ScanMode;
use super::super::device::Device;
use super::super::ObjectId;
use super::{has_header, ScannedChunk};

impl<N: NandDriver> Device<N> {
    /// rebuild the filesystem walking blocks and chunks in physical order
    pub(crate) fn scan_forwards(&mut self) -> Result<()> {
        let to_scan = self.classify_blocks()?;
        info!("forward scan of {} over {} blocks", self.config.name, to_scan.len());

        let mut hard_links = Vec::new();
        for (block, block_seq) in to_scan {
            self.scan_block_forwards(block, block_seq, &mut hard_links)?;
        }

        self.skip_rest_of_block();
        self.hardlink_fixup(&hard_links);
        Ok(())
    }

    fn scan_block_forwards(
        &mut self,
        block: u32,
        block_seq: u32,
        hard_links: &mut Vec<ObjectId>,
    ) -> Result<()> {
        let cpb = self.chunks_per_block;
        let mut last_used = None;
        for page in 0..cpb {
            let chunk = block * cpb + page;
            let (tags, kind) = self.examine_chunk(chunk, block_seq)?;
            if tags.chunk_used {
                last_used = Some(page);
            }
            let Some(kind) = kind else {
                self.n_free_chunks += 1;
                continue;
            };
            self.mark_scanned_chunk_in_use(chunk);
            match kind {
                ScannedChunk::Data => self.scan_data_chunk_forwards(chunk, &tags)?,
                ScannedChunk::Header => self.scan_header_forwards(chunk, &tags, hard_links)?,
            }
        }

        match last_used {
            None => {
                self.block_info_mut(block).state = BlockState::Empty;
                self.n_erased_blocks += 1;
            }
            Some(page) if page + 1 < cpb && block_seq == self.seq_number => {
                self.block_info_mut(block).state = BlockState::Allocating;
                self.alloc_block = Some(block);
                self.alloc_page = page + 1;
                self.alloc_block_finder = block;
            }
            Some(_) => self.block_info_mut(block).state = BlockState::Full,
        }
        let bi = *self.block_info(block);
        if bi.pages_in_use == 0 && !bi.has_shrink_header && bi.state == BlockState::Full {
            debug!("block {block} holds nothing live, erasing it");
            self.block_became_dirty(block);
        }
        Ok(())
    }

    fn scan_data_chunk_forwards(&mut self, chunk: u32, tags: &ExtendedTags) -> Result<()> {
        let id = self.find_or_create_object(tags.obj_id, ObjectType::File)?;
        let obj = self.obj(id)?;
        if !obj.is_file() || obj.is_shadowed {
            debug!("dropping data chunk {chunk} of object {id}");
            self.delete_chunk(chunk);
            return Ok(());
        }
        self.put_chunk_in_file(id, tags.chunk_id, chunk, PutMode::ForwardScan)?;
        let end = (tags.chunk_id as u64 - 1) * self.data_bytes_per_chunk as u64 + tags.n_bytes as u64;
        if let Some(file) = self.obj_mut(id)?.file_mut() {
            file.scanned_size = file.scanned_size.max(end);
            file.file_size = file.file_size.max(end);
        }
        Ok(())
    }

    fn scan_header_forwards(
        &mut self,
        chunk: u32,
        tags: &ExtendedTags,
        hard_links: &mut Vec<ObjectId>,
    ) -> Result<()> {
        let is_fake = self.objects.get(tags.obj_id).is_some_and(|o| o.fake);
        let want_body = self.config.disable_lazy_load
            || is_fake
            || tags.extra.is_some_and(|info| info.shadows > 0);
        let Some(header) = self.scanned_header(chunk, tags, want_body)? else {
            warn!("header chunk {chunk} of object {} is unusable", tags.obj_id);
            self.delete_chunk(chunk);
            return Ok(());
        };
        let id = self.find_or_create_object(tags.obj_id, header.obj_type)?;

        let obj = self.obj(id)?;
        if obj.is_shadowed {
            // renamed over, whatever this header says is history
            self.delete_chunk(chunk);
            return Ok(());
        }
        if has_header(obj) {
            let (old_chunk, old_serial) = (obj.hdr_chunk, obj.serial);
            if compare_serials(old_serial, tags.serial_number) == SerialOrder::ExistingNewer {
                debug!("header {chunk} of object {id} is older than {old_chunk}");
                self.delete_chunk(chunk);
                return Ok(());
            }
            debug!("header {chunk} of object {id} replaces {old_chunk}");
            self.delete_chunk(old_chunk);
        }

        if self.obj(id)?.fake {
            return self.apply_builtin_dir_header(id, chunk, tags.serial_number, &header);
        }
        self.apply_scanned_header(id, chunk, tags.serial_number, &header, ScanMode::Forward, hard_links)
    }
}
