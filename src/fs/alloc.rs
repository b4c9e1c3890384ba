//! block and chunk allocation, chunk deletion and block retirement
use log::{debug, error, info, warn};

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver};

use super::block_info::{BlockInfo, BlockState};
use super::device::Device;
use super::SEQUENCE_BAD_BLOCK;

/// chunk errors a block may collect before it is retired
const MAX_CHUNK_ERROR_STRIKES: u8 = 3;

impl<N: NandDriver> Device<N> {
    /// next empty block, round robin from the last one handed out
    fn find_block_for_allocation(&mut self) -> Option<u32> {
        if self.n_erased_blocks < 1 {
            debug!("no erased blocks left to allocate from");
            return None;
        }
        for _ in 0..self.n_blocks() {
            self.alloc_block_finder += 1;
            if !self.is_valid_block(self.alloc_block_finder) {
                self.alloc_block_finder = self.internal_start_block;
            }
            let block = self.alloc_block_finder;
            if self.block_info(block).state == BlockState::Empty {
                self.seq_number += 1;
                let seq_number = self.seq_number;
                let bi = self.block_info_mut(block);
                bi.state = BlockState::Allocating;
                bi.seq_number = seq_number;
                self.n_erased_blocks -= 1;
                debug!("allocating block {block} with sequence {seq_number:#x}");
                return Some(block);
            }
        }
        error!(
            "{} erased blocks counted but none found",
            self.n_erased_blocks
        );
        None
    }

    /// `true` when `n_chunks` can be written without eating into the reserve
    pub(crate) fn check_space_for_allocation(&mut self, n_chunks: u32) -> bool {
        let reserved_blocks =
            self.config.n_reserved_blocks + self.checkpoint_blocks_required();
        let reserved_chunks = reserved_blocks as i64 * self.chunks_per_block as i64;
        self.n_free_chunks > reserved_chunks + n_chunks as i64
    }

    /// hand out the next erased chunk
    /// # Params
    /// - `use_reserve`: allowed to take chunks held back for garbage collection
    /// # Return
    /// the chunk and the block it is in
    fn allocate_chunk(&mut self, use_reserve: bool) -> Result<(u32, u32)> {
        if self.alloc_block.is_none() {
            self.alloc_block = self.find_block_for_allocation();
            self.alloc_page = 0;
        }
        if !use_reserve && !self.check_space_for_allocation(0) {
            return Err(FlashError::OutOfSpace);
        }
        let block = self.alloc_block.ok_or(FlashError::OutOfSpace)?;
        if self.n_erased_blocks < self.config.n_reserved_blocks
            && self.alloc_page == 0
        {
            debug!("allocating reserve");
        }
        let page = self.alloc_page;
        let chunk = block * self.chunks_per_block + page;
        self.block_info_mut(block).pages_in_use += 1;
        self.set_chunk_bit(block, page);
        self.alloc_page += 1;
        self.n_free_chunks -= 1;
        if self.alloc_page >= self.chunks_per_block {
            self.block_info_mut(block).state = BlockState::Full;
            self.alloc_block = None;
        }
        Ok((chunk, block))
    }

    /// stop allocating from the current block
    pub(crate) fn skip_rest_of_block(&mut self) {
        if let Some(block) = self.alloc_block.take() {
            let bi = self.block_info_mut(block);
            if bi.state == BlockState::Allocating {
                bi.state = BlockState::Full;
            }
        }
    }

    /// write `data` to a fresh chunk, retrying on other chunks after failures
    /// # Params
    /// - `data`: chunk data, shorter than a chunk for the tail of a file
    /// - `tags`: tags for the chunk, the sequence number is filled in here
    /// - `use_reserve`: allowed to take chunks held back for garbage collection
    /// # Return
    /// the physical chunk the data ended up in
    pub(crate) fn write_new_chunk_with_tags(
        &mut self,
        data: &[u8],
        tags: &ExtendedTags,
        use_reserve: bool,
    ) -> Result<u32> {
        self.invalidate_checkpoint();
        let mut buffer = self.new_chunk_buffer();
        let n = data.len().min(buffer.len());
        buffer[..n].copy_from_slice(&data[..n]);

        let mut attempts = 0u32;
        let result = loop {
            if self.config.write_attempts > 0 && attempts >= self.config.write_attempts {
                break Err(FlashError::OutOfSpace);
            }
            let (chunk, block) = match self.allocate_chunk(use_reserve) {
                Ok(allocated) => allocated,
                Err(e) => break Err(e),
            };
            attempts += 1;

            if self.config.always_check_erased {
                self.block_info_mut(block).skip_erased_check = false;
            }
            let check_erased = !self.block_info(block).skip_erased_check;
            if check_erased && !self.check_chunk_erased(chunk)? {
                warn!("chunk {chunk} was not erased");
                self.delete_chunk(chunk);
                self.skip_rest_of_block();
                continue;
            }

            let mut write_tags = *tags;
            write_tags.chunk_used = true;
            write_tags.seq_number = self.block_info(block).seq_number;
            let mut written = self.write_chunk_raw(chunk, &buffer, &write_tags);
            if written.is_ok() && check_erased {
                written = self.verify_chunk_written(chunk, &buffer, &write_tags);
            }
            match written {
                Ok(()) => {
                    self.block_info_mut(block).skip_erased_check = true;
                    break Ok(chunk);
                }
                Err(e) => {
                    warn!("writing chunk {chunk} failed: {e}");
                    self.handle_write_chunk_error(chunk);
                }
            }
        };

        if attempts > 1 {
            warn!("chunk write needed {attempts} attempts");
            self.stats.n_retried_writes += (attempts - 1) as u64;
        }
        result
    }

    /// every byte of the chunk reads back as erased flash
    fn check_chunk_erased(&mut self, chunk: u32) -> Result<bool> {
        let mut data = self.new_chunk_buffer();
        let tags = self.read_chunk(chunk, Some(&mut data))?;
        Ok(!tags.ecc_failed() && !tags.chunk_used && data.iter().all(|&b| b == 0xff))
    }

    fn verify_chunk_written(&mut self, chunk: u32, data: &[u8], tags: &ExtendedTags) -> Result<()> {
        let mut read_back = self.new_chunk_buffer();
        let read_tags = self.read_chunk(chunk, Some(&mut read_back))?;
        let same_tags = read_tags.obj_id == tags.obj_id
            && read_tags.chunk_id == tags.chunk_id
            && read_tags.n_bytes == tags.n_bytes
            && read_tags.serial_number == tags.serial_number & 3;
        if read_tags.ecc_failed() || !same_tags || read_back != data {
            return Err(FlashError::WriteVerifyFailed { chunk });
        }
        Ok(())
    }

    /// mark a chunk's block for retirement once it has collected enough errors
    pub(crate) fn handle_chunk_error(&mut self, block: u32) {
        if !self.is_valid_block(block) {
            return;
        }
        let bi = self.block_info_mut(block);
        if !bi.gc_prioritise {
            bi.gc_prioritise = true;
            bi.chunk_error_strikes = bi.chunk_error_strikes.saturating_add(1);
            if bi.chunk_error_strikes > MAX_CHUNK_ERROR_STRIKES {
                bi.needs_retiring = true;
            }
            self.gc.has_pending_prioritised = true;
        }
    }

    fn handle_write_chunk_error(&mut self, chunk: u32) {
        let (block, _) = self.split_chunk(chunk);
        self.handle_chunk_error(block);
        info!("block {block} will be retired after a write failure");
        self.block_info_mut(block).needs_retiring = true;
        self.delete_chunk(chunk);
        self.skip_rest_of_block();
    }

    /// give a chunk back, 0 is ignored
    pub(crate) fn delete_chunk(&mut self, chunk: u32) {
        if chunk == 0 || !self.is_valid_chunk(chunk) {
            return;
        }
        let (block, page) = self.split_chunk(chunk);
        self.stats.n_deletions += 1;
        self.update_oldest_dirty_seq(block);

        let state = self.block_info(block).state;
        let in_use = self.chunk_bits.check(self.block_index(block), page as usize);
        if in_use
            && matches!(
                state,
                BlockState::Allocating
                    | BlockState::Full
                    | BlockState::NeedsScanning
                    | BlockState::Collecting
            )
        {
            self.n_free_chunks += 1;
            self.clear_chunk_bit(block, page);
            let bi = self.block_info_mut(block);
            bi.pages_in_use = bi.pages_in_use.saturating_sub(1);
        }

        let bi = *self.block_info(block);
        if bi.pages_in_use == 0
            && !bi.has_shrink_header
            && !matches!(state, BlockState::Allocating | BlockState::NeedsScanning)
        {
            self.block_became_dirty(block);
        }
    }

    /// erase a block nothing lives in any more, or retire it
    pub(crate) fn block_became_dirty(&mut self, block: u32) {
        self.clear_oldest_dirty_seq(block);
        self.block_info_mut(block).state = BlockState::Dirty;
        if self.gc.block == Some(block) {
            self.gc.block = None;
        }
        if self.gc.dirtiest == Some(block) {
            self.gc.dirtiest = None;
            self.gc.pages_in_use = 0;
        }

        let mut erased_ok = false;
        if !self.block_info(block).needs_retiring {
            self.invalidate_checkpoint();
            match self.erase_block_in_nand(block) {
                Ok(()) => erased_ok = true,
                Err(e) => {
                    self.stats.n_erase_failures += 1;
                    warn!("erasure of block {block} failed: {e}");
                }
            }
        }

        if erased_ok {
            let bi = self.block_info_mut(block);
            *bi = BlockInfo {
                state: BlockState::Empty,
                skip_erased_check: true,
                chunk_error_strikes: bi.chunk_error_strikes,
                ..BlockInfo::default()
            };
            self.n_erased_blocks += 1;
            self.clear_block_bits(block);
            debug!("erased block {block}");
        } else {
            self.n_free_chunks -= self.chunks_per_block as i64;
            self.retire_block(block);
        }
    }

    /// take a block out of service for good
    pub(crate) fn retire_block(&mut self, block: u32) {
        self.invalidate_checkpoint();
        self.clear_oldest_dirty_seq(block);

        if let Err(e) = self.mark_block_bad_in_nand(block) {
            warn!("marking block {block} bad failed: {e}");
            if self.erase_block_in_nand(block).is_err() {
                self.stats.n_erase_failures += 1;
                error!("block {block} can neither be marked bad nor erased");
            } else {
                let tags = ExtendedTags {
                    chunk_used: true,
                    seq_number: SEQUENCE_BAD_BLOCK,
                    ..ExtendedTags::default()
                };
                let data = vec![0xffu8; self.data_bytes_per_chunk as usize];
                let chunk = block * self.chunks_per_block;
                if self.write_chunk_raw(chunk, &data, &tags).is_err() {
                    error!("writing the bad block sequence to block {block} failed");
                }
            }
        }

        let bi = self.block_info_mut(block);
        bi.state = BlockState::Dead;
        bi.gc_prioritise = false;
        bi.needs_retiring = false;
        self.stats.n_retired_blocks += 1;
        info!("retired block {block}");
    }

    /// smallest sequence number among full blocks with reclaimable chunks
    fn calc_oldest_dirty_seq(&mut self) {
        let cpb = self.chunks_per_block;
        let oldest = self
            .block_range()
            .filter(|&b| {
                let bi = self.block_info(b);
                bi.state == BlockState::Full && bi.live_pages() < cpb
            })
            .min_by_key(|&b| self.block_info(b).seq_number);
        match oldest {
            Some(block) => {
                self.gc.oldest_dirty_seq = self.block_info(block).seq_number;
                self.gc.oldest_dirty_block = Some(block);
            }
            None => {
                self.gc.oldest_dirty_seq = 0;
                self.gc.oldest_dirty_block = None;
            }
        }
    }

    pub(crate) fn find_oldest_dirty_seq(&mut self) {
        if self.gc.oldest_dirty_seq == 0 {
            self.calc_oldest_dirty_seq();
        }
    }

    fn clear_oldest_dirty_seq(&mut self, block: u32) {
        if self.gc.oldest_dirty_seq == 0
            || self.block_info(block).seq_number == self.gc.oldest_dirty_seq
        {
            self.gc.oldest_dirty_seq = 0;
            self.gc.oldest_dirty_block = None;
        }
    }

    fn update_oldest_dirty_seq(&mut self, block: u32) {
        let seq_number = self.block_info(block).seq_number;
        if self.gc.oldest_dirty_seq != 0 && seq_number < self.gc.oldest_dirty_seq {
            self.gc.oldest_dirty_seq = seq_number;
            self.gc.oldest_dirty_block = Some(block);
        }
    }

    /// a block holding a shrink header can only be collected once every
    /// block written before it has been
    pub(crate) fn block_not_disqualified_for_gc(&mut self, block: u32) -> bool {
        if !self.block_info(block).has_shrink_header {
            return true;
        }
        self.find_oldest_dirty_seq();
        self.block_info(block).seq_number <= self.gc.oldest_dirty_seq
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FlashError;
    use crate::fs::test_support::*;
    use crate::nand::{ExtendedTags, NandDriver};

    #[test]
    fn allocation_walks_the_empty_blocks() {
        let mut dev = small_device();
        let free_before = dev.n_free_chunks();
        let erased_before = dev.n_erased_blocks();
        let tags = ExtendedTags {
            obj_id: 300,
            chunk_id: 1,
            n_bytes: 3,
            ..ExtendedTags::default()
        };
        let chunk = dev.write_new_chunk_with_tags(b"abc", &tags, false).unwrap();
        let (block, page) = dev.split_chunk(chunk);
        assert_eq!(page, 0);
        assert_eq!(dev.n_free_chunks(), free_before - 1);
        assert_eq!(dev.n_erased_blocks(), erased_before - 1);
        let bi = dev.block(block).unwrap();
        assert_eq!(bi.pages_in_use, 1);
        assert_eq!(bi.state, crate::BlockState::Allocating);
        assert!(dev.chunk_in_use(chunk));

        dev.delete_chunk(chunk);
        assert!(!dev.chunk_in_use(chunk));
        assert_eq!(dev.n_free_chunks(), free_before);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn failed_write_retires_the_block() {
        let mut dev = faulty_device();
        let tags = ExtendedTags {
            obj_id: 300,
            chunk_id: 1,
            n_bytes: 4,
            ..ExtendedTags::default()
        };
        let first = dev.write_new_chunk_with_tags(b"good", &tags, false).unwrap();
        let (bad_block, _) = dev.split_chunk(first);
        // the next chunk in the same block fails to program
        let nand_chunk = first + 1 - dev.block_offset * dev.chunks_per_block;
        dev.nand_mut().fail_writes.insert(nand_chunk);

        let second = dev.write_new_chunk_with_tags(b"next", &tags, false).unwrap();
        assert_ne!(dev.split_chunk(second).0, bad_block);
        assert!(dev.block(bad_block).unwrap().needs_retiring);
        assert_eq!(dev.stats().n_retried_writes, 1);

        // once its last chunk goes the block is retired instead of erased
        dev.delete_chunk(first);
        assert_eq!(dev.block(bad_block).unwrap().state, crate::BlockState::Dead);
        assert_eq!(dev.stats().n_retired_blocks, 1);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn failed_erase_retires_the_block() {
        let mut dev = faulty_device();
        let (block, chunks) = fill_block(&mut dev, 300);
        let nand_block = block - dev.block_offset;
        dev.nand_mut().fail_erases.insert(nand_block);
        let free_before = dev.n_free_chunks();

        for &chunk in &chunks {
            dev.delete_chunk(chunk);
        }
        let bi = dev.block(block).unwrap();
        assert_eq!(bi.state, crate::BlockState::Dead);
        assert_eq!(bi.pages_in_use, 0);
        assert_eq!(dev.stats().n_erase_failures, 1);
        assert_eq!(dev.stats().n_retired_blocks, 1);
        assert!(dev.nand_mut().is_block_bad(nand_block).unwrap());
        // the block's chunks were freed by the deletions, then lost with it
        assert_eq!(dev.n_free_chunks(), free_before);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn ordinary_writes_stop_at_the_reserve() {
        let mut dev = small_device();
        let tags = ExtendedTags {
            obj_id: 300,
            chunk_id: 1,
            n_bytes: 1,
            ..ExtendedTags::default()
        };
        let total = dev.block_range().count() as u32 * dev.chunks_per_block();
        let mut refused = None;
        for _ in 0..total {
            if let Err(e) = dev.write_new_chunk_with_tags(b"r", &tags, false) {
                refused = Some(e);
                break;
            }
        }
        assert!(matches!(refused, Some(FlashError::OutOfSpace)));
        assert!(!dev.check_space_for_allocation(0));
        let reserve = dev.config().n_reserved_blocks as i64 * dev.chunks_per_block() as i64;
        assert!(dev.n_free_chunks() >= reserve);

        // the garbage collector may still dig into the reserve
        let chunk = dev.write_new_chunk_with_tags(b"gc", &tags, true).unwrap();
        assert!(dev.chunk_in_use(chunk));
        dev.check_invariants().unwrap();
    }

    #[test]
    fn shrink_header_block_waits_for_older_dirty_blocks() {
        let mut dev = small_device();
        let (older, older_chunks) = fill_block(&mut dev, 300);
        let (newer, newer_chunks) = fill_block(&mut dev, 301);
        assert!(dev.block(older).unwrap().seq_number < dev.block(newer).unwrap().seq_number);
        dev.block_info_mut(newer).has_shrink_header = true;
        dev.delete_chunk(older_chunks[0]);
        dev.delete_chunk(newer_chunks[0]);

        assert!(dev.block_not_disqualified_for_gc(older));
        assert!(!dev.block_not_disqualified_for_gc(newer));

        // once the older block is gone the shrink header may be collected
        for &chunk in &older_chunks[1..] {
            dev.delete_chunk(chunk);
        }
        assert_eq!(dev.block(older).unwrap().state, crate::BlockState::Empty);
        assert!(dev.block_not_disqualified_for_gc(newer));
        dev.check_invariants().unwrap();
    }
}
