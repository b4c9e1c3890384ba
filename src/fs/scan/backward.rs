//! newest block first: the first copy of anything seen is the one that counts
use log::{debug, info, warn};

use crate::error::Result;
use crate::nand::{ExtendedTags, NandDriver, ObjectType};

use super::super::block_info::BlockState;
use super::super::chunk_map::PutMode;
use super::super::config::ScanMode;
use super::super::device::Device;
use super::super::ObjectId;
use super::{has_header, ScannedChunk};

impl<N: NandDriver> Device<N> {
    /// rebuild the filesystem walking blocks in descending sequence order
    /// and the chunks of each block from last to first
    pub(crate) fn scan_backwards(&mut self) -> Result<()> {
        let mut to_scan = self.classify_blocks()?;
        to_scan.sort_unstable_by_key(|&(block, seq)| (seq, block));
        info!(
            "backward scan of {} over {} blocks, newest sequence {:#x}",
            self.config.name,
            to_scan.len(),
            self.seq_number
        );

        let mut hard_links = Vec::new();
        for &(block, block_seq) in to_scan.iter().rev() {
            self.scan_block_backwards(block, block_seq, &mut hard_links)?;
        }

        // a torn write may sit at the end of the block being filled
        self.skip_rest_of_block();
        self.hardlink_fixup(&hard_links);
        Ok(())
    }

    fn scan_block_backwards(
        &mut self,
        block: u32,
        block_seq: u32,
        hard_links: &mut Vec<ObjectId>,
    ) -> Result<()> {
        let cpb = self.chunks_per_block;
        let mut found_chunks = false;
        for page in (0..cpb).rev() {
            let chunk = block * cpb + page;
            let (tags, kind) = self.examine_chunk(chunk, block_seq)?;
            let Some(kind) = kind else {
                if !tags.chunk_used && !found_chunks {
                    self.unused_chunk_seen_backwards(block, block_seq, page);
                }
                self.n_free_chunks += 1;
                continue;
            };
            found_chunks = true;
            self.mark_scanned_chunk_in_use(chunk);
            match kind {
                ScannedChunk::Data => self.scan_data_chunk_backwards(chunk, &tags)?,
                ScannedChunk::Header => self.scan_header_backwards(chunk, &tags, hard_links)?,
            }
        }

        let bi = self.block_info_mut(block);
        if bi.state == BlockState::NeedsScanning {
            bi.state = BlockState::Full;
        }
        let bi = *self.block_info(block);
        if bi.pages_in_use == 0 && !bi.has_shrink_header && bi.state == BlockState::Full {
            debug!("block {block} holds nothing live, erasing it");
            self.block_became_dirty(block);
        }
        Ok(())
    }

    /// an erased chunk with nothing written above it:
    /// the block is empty or it is the one that was being filled
    fn unused_chunk_seen_backwards(&mut self, block: u32, block_seq: u32, page: u32) {
        if page == 0 {
            self.block_info_mut(block).state = BlockState::Empty;
            self.n_erased_blocks += 1;
        } else if block_seq == self.seq_number {
            self.block_info_mut(block).state = BlockState::Allocating;
            self.alloc_block = Some(block);
            self.alloc_page = page;
            self.alloc_block_finder = block;
        }
    }

    fn scan_data_chunk_backwards(&mut self, chunk: u32, tags: &ExtendedTags) -> Result<()> {
        let id = self.find_or_create_object(tags.obj_id, ObjectType::File)?;
        let cb = self.data_bytes_per_chunk as u64;
        let base = (tags.chunk_id as u64 - 1) * cb;
        let obj = self.obj(id)?;
        let (shrink_size, valid) = (obj.file().map(|f| f.shrink_size), obj.valid);
        let Some(shrink_size) = shrink_size else {
            warn!("data chunk {chunk} belongs to object {id}, which is not a file");
            self.delete_chunk(chunk);
            return Ok(());
        };
        if base >= shrink_size {
            // a newer header cut the file short of this chunk
            self.delete_chunk(chunk);
            return Ok(());
        }

        self.put_chunk_in_file(id, tags.chunk_id, chunk, PutMode::BackwardScan)?;
        if !valid {
            let end = base + tags.n_bytes as u64;
            if let Some(file) = self.obj_mut(id)?.file_mut() {
                if file.scanned_size < end {
                    file.scanned_size = end;
                    file.file_size = end;
                }
            }
        }
        Ok(())
    }

    fn scan_header_backwards(
        &mut self,
        chunk: u32,
        tags: &ExtendedTags,
        hard_links: &mut Vec<ObjectId>,
    ) -> Result<()> {
        let existing = self.objects.get(tags.obj_id);
        let seen = existing.is_some_and(has_header);
        let is_fake = existing.is_some_and(|o| o.fake);
        let want_body = !seen
            && (self.config.disable_lazy_load || is_fake)
            || tags.extra.is_some_and(|info| info.shadows > 0);
        let Some(header) = self.scanned_header(chunk, tags, want_body)? else {
            warn!("header chunk {chunk} of object {} is unusable", tags.obj_id);
            self.delete_chunk(chunk);
            return Ok(());
        };
        let id = self.find_or_create_object(tags.obj_id, header.obj_type)?;

        if seen {
            // an older header: all it can still contribute is where the file was cut
            if header.obj_type == ObjectType::File {
                let (size, shrink) = header.effective_size();
                if shrink {
                    if let Some(file) = self.obj_mut(id)?.file_mut() {
                        file.shrink_size = file.shrink_size.min(size);
                    }
                    let (block, _) = self.split_chunk(chunk);
                    self.block_info_mut(block).has_shrink_header = true;
                }
            }
            self.delete_chunk(chunk);
            return Ok(());
        }

        if self.obj(id)?.fake {
            return self.apply_builtin_dir_header(id, chunk, tags.serial_number, &header);
        }
        self.apply_scanned_header(id, chunk, tags.serial_number, &header, ScanMode::Backward, hard_links)
    }
}
