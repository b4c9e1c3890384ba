//! garbage collection: pick a block with few live chunks, copy them off, erase it
use log::{debug, error, trace, warn};

use crate::error::{FlashError, Result};
use crate::nand::NandDriver;

use super::block_info::BlockState;
use super::chunk_map::PutMode;
use super::device::Device;
use super::object_header::ObjectHeader;
use super::{ObjectId, GC_GOOD_ENOUGH, GC_PASSIVE_THRESHOLD, MAX_COPIES_PER_PASS};

/// passive collections skipped while erased space is plentiful
const GC_SKIP_RESET: u32 = 5;
const GC_SKIP_MAX: u32 = 20;
/// refresh is off for periods below this
const MIN_REFRESH_PERIOD: u32 = 10;

#[derive(Debug, Default, Clone)]
pub(crate) struct GcState {
    /// block being collected, possibly over several passes
    pub block: Option<u32>,
    /// next page of `block` to look at
    pub chunk: u32,
    pub dirtiest: Option<u32>,
    pub pages_in_use: u32,
    pub block_finder: u32,
    pub not_done: u32,
    pub skip: u32,
    /// set while collecting so that writes done by the collector don't recurse
    pub disable: bool,
    pub has_pending_prioritised: bool,
    pub oldest_dirty_seq: u32,
    pub oldest_dirty_block: Option<u32>,
    pub refresh_skip: u32,
    /// soft deleted files whose last chunk went during the current collection
    pub cleanups: Vec<ObjectId>,
}

impl<N: NandDriver> Device<N> {
    /// collect garbage if space is getting tight
    /// # Params
    /// - `background`: called from idle time, collect even if space is fine
    pub(crate) fn check_garbage_collection(&mut self, background: bool) {
        if self.gc.disable {
            return;
        }
        let cpb = self.chunks_per_block as i64;
        let mut aggressive = false;
        let mut tries = 0;
        loop {
            tries += 1;
            let min_erased =
                self.config.n_reserved_blocks + self.checkpoint_blocks_required() + 1;
            let erased_chunks = self.n_erased_blocks as i64 * cpb;

            if self.n_erased_blocks < min_erased {
                aggressive = true;
            } else {
                if !background && erased_chunks > self.n_free_chunks / 4 {
                    break;
                }
                self.gc.skip = self.gc.skip.min(GC_SKIP_MAX);
                if erased_chunks < self.n_free_chunks / 2 || self.gc.skip < 1 || background {
                    aggressive = false;
                } else {
                    self.gc.skip -= 1;
                    break;
                }
            }
            self.gc.skip = GC_SKIP_RESET;

            if self.gc.block.is_none() && !aggressive {
                self.gc.block = self.find_refresh_block();
                self.gc.chunk = 0;
                self.gc.cleanups.clear();
            }
            if self.gc.block.is_none() {
                self.gc.block = self.find_block_for_gc(aggressive, background);
                self.gc.chunk = 0;
                self.gc.cleanups.clear();
            }

            if let Some(block) = self.gc.block {
                if aggressive {
                    self.stats.aggressive_gc_count += 1;
                } else {
                    self.stats.passive_gc_count += 1;
                }
                debug!(
                    "gc of block {block}: {} erased blocks, aggressive {aggressive}",
                    self.n_erased_blocks
                );
                if let Err(e) = self.collect_block(block, aggressive) {
                    warn!("gc of block {block} failed: {e}");
                }
            }

            if !(self.n_erased_blocks < self.config.n_reserved_blocks
                && self.gc.block.is_some()
                && tries < 2)
            {
                break;
            }
            warn!(
                "gc reclaimed nothing, {} erased blocks after try {tries}",
                self.n_erased_blocks
            );
        }
    }

    /// one round of idle time collection
    /// # Return
    /// `true` when at least half of the free chunks are erased
    pub fn background_gc(&mut self) -> bool {
        let erased_chunks = self.n_erased_blocks as i64 * self.chunks_per_block as i64;
        self.stats.background_gc_count += 1;
        self.check_garbage_collection(true);
        erased_chunks > self.n_free_chunks / 2
    }

    /// collect one full block completely, right now
    pub fn garbage_collect_block(&mut self, block: u32) -> Result<()> {
        if !self.is_valid_block(block) || self.block_info(block).state != BlockState::Full {
            return Err(FlashError::NotPermitted);
        }
        if let Some(other) = self.gc.block.filter(|&b| b != block) {
            self.collect_block(other, true)?;
        }
        self.gc.block = Some(block);
        self.gc.chunk = 0;
        self.gc.cleanups.clear();
        self.collect_block(block, true)
    }

    /// the oldest full block, once every `refresh_period` selections
    fn find_refresh_block(&mut self) -> Option<u32> {
        if self.config.refresh_period < MIN_REFRESH_PERIOD {
            return None;
        }
        self.gc.refresh_skip = self.gc.refresh_skip.min(self.config.refresh_period);
        if self.gc.refresh_skip > 0 {
            return None;
        }
        self.gc.refresh_skip = self.config.refresh_period;
        self.stats.refresh_count += 1;
        let oldest = self
            .block_range()
            .filter(|&b| self.block_info(b).state == BlockState::Full)
            .min_by_key(|&b| self.block_info(b).seq_number);
        if let Some(block) = oldest {
            debug!(
                "refresh {} selected block {block} with sequence {:#x}",
                self.stats.refresh_count,
                self.block_info(block).seq_number
            );
        }
        oldest
    }

    /// pick the dirtiest block, or one dirty enough
    fn find_block_for_gc(&mut self, aggressive: bool, background: bool) -> Option<u32> {
        let cpb = self.chunks_per_block;
        let mut selected = None;

        if self.gc.has_pending_prioritised && !aggressive {
            self.gc.dirtiest = None;
            let mut prioritised_exists = false;
            for block in self.block_range() {
                if !self.block_info(block).gc_prioritise {
                    continue;
                }
                prioritised_exists = true;
                if self.block_info(block).state == BlockState::Full
                    && self.block_not_disqualified_for_gc(block)
                {
                    selected = Some(block);
                    break;
                }
            }
            // a prioritised block held back by an older dirty block
            if prioritised_exists && selected.is_none() {
                selected = self.gc.oldest_dirty_block;
            }
            if !prioritised_exists {
                self.gc.has_pending_prioritised = false;
            }
        }

        let mut threshold = 0;
        if selected.is_none() {
            let n_blocks = self.n_blocks();
            let iterations;
            if aggressive {
                threshold = cpb;
                iterations = n_blocks;
            } else {
                let max_threshold = if background { cpb / 2 } else { cpb / 8 }
                    .max(GC_PASSIVE_THRESHOLD);
                threshold = if background { (self.gc.not_done + 2) * 2 } else { 0 };
                threshold = threshold.max(GC_PASSIVE_THRESHOLD).min(max_threshold);
                iterations = (n_blocks / 16 + 1).min(100);
            }

            for _ in 0..iterations {
                if self.gc.dirtiest.is_some() && self.gc.pages_in_use <= GC_GOOD_ENOUGH {
                    break;
                }
                self.gc.block_finder += 1;
                if !self.is_valid_block(self.gc.block_finder) {
                    self.gc.block_finder = self.internal_start_block;
                }
                let block = self.gc.block_finder;
                let bi = *self.block_info(block);
                let pages_used = bi.live_pages();
                if bi.state == BlockState::Full
                    && pages_used < cpb
                    && (self.gc.dirtiest.is_none() || pages_used < self.gc.pages_in_use)
                    && self.block_not_disqualified_for_gc(block)
                {
                    self.gc.dirtiest = Some(block);
                    self.gc.pages_in_use = pages_used;
                }
            }
            if self.gc.dirtiest.is_some() && self.gc.pages_in_use <= threshold {
                selected = self.gc.dirtiest;
            }
        }

        // nothing chosen for a while: the oldest dirty block is in the way
        if selected.is_none() && self.gc.not_done >= if background { 10 } else { 20 } {
            self.find_oldest_dirty_seq();
            match self.gc.oldest_dirty_block {
                Some(block) => {
                    selected = Some(block);
                    self.stats.oldest_dirty_gc_count += 1;
                }
                None => self.gc.not_done = 0,
            }
        }

        match selected {
            Some(block) => {
                debug!(
                    "gc selected block {block} with {} live pages",
                    self.block_info(block).live_pages()
                );
                self.stats.n_gc_blocks += 1;
                self.gc.dirtiest = None;
                self.gc.pages_in_use = 0;
                self.gc.not_done = 0;
                self.gc.refresh_skip = self.gc.refresh_skip.saturating_sub(1);
            }
            None => {
                self.gc.not_done += 1;
                trace!(
                    "gc found nothing: finder {} not done {} threshold {threshold}",
                    self.gc.block_finder,
                    self.gc.not_done
                );
            }
        }
        selected
    }

    /// copy the live chunks off `block`; erase it once none are left
    /// # Params
    /// - `whole_block`: copy everything now instead of a few chunks per call
    fn collect_block(&mut self, block: u32, whole_block: bool) -> Result<()> {
        let state = self.block_info(block).state;
        debug!(
            "collecting block {block}: {} in use, whole {whole_block}",
            self.block_info(block).pages_in_use
        );
        if state == BlockState::Full {
            self.block_info_mut(block).state = BlockState::Collecting;
        }
        self.block_info_mut(block).has_shrink_header = false;
        self.gc.disable = true;

        let result = if state == BlockState::Checkpoint || !self.block_has_chunks(block) {
            self.block_became_dirty(block);
            Ok(())
        } else {
            let max_copies = if whole_block {
                self.chunks_per_block
            } else {
                MAX_COPIES_PER_PASS
            };
            self.copy_live_chunks(block, max_copies)
        };

        let cleaned = if self.block_info(block).state == BlockState::Collecting {
            // unfinished, checkpoints don't record collections in progress
            self.block_info_mut(block).state = BlockState::Full;
            Ok(())
        } else {
            self.gc.block = None;
            self.gc.chunk = 0;
            self.finish_soft_deleted_files()
        };
        self.gc.disable = false;
        result.and(cleaned)
    }

    /// delete the soft deleted files the last collection took the final chunks of
    fn finish_soft_deleted_files(&mut self) -> Result<()> {
        let mut first_error = None;
        for obj_id in std::mem::take(&mut self.gc.cleanups) {
            if !self.objects.contains(obj_id) {
                continue;
            }
            debug!("finally deleting object {obj_id}");
            if let Some(file) = self.objects.get_mut(obj_id).and_then(|o| o.file_mut()) {
                file.tree.clear();
            }
            match self.do_generic_object_deletion(obj_id) {
                Ok(()) => self.n_deleted_files = self.n_deleted_files.saturating_sub(1),
                Err(e) => {
                    error!("deleting soft deleted object {obj_id} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn copy_live_chunks(&mut self, block: u32, mut max_copies: u32) -> Result<()> {
        let cpb = self.chunks_per_block;
        let mut buffer = self.new_chunk_buffer();
        while self.gc.chunk < cpb
            && self.block_info(block).state == BlockState::Collecting
            && max_copies > 0
        {
            let page = self.gc.chunk;
            self.gc.chunk += 1;
            if !self.chunk_bits.check(self.block_index(block), page as usize) {
                continue;
            }
            max_copies -= 1;
            let old_chunk = block * cpb + page;
            let mut tags = self.read_chunk(old_chunk, Some(&mut buffer))?;

            let Some(obj) = self.objects.get(tags.obj_id) else {
                error!(
                    "chunk {old_chunk} in gc has no object: {} {}",
                    tags.obj_id, tags.chunk_id
                );
                self.delete_chunk(old_chunk);
                continue;
            };

            if obj.deleted && obj.soft_deleted && tags.chunk_id != 0 {
                // the free count already includes soft deleted chunks,
                // deleting this one counts it again
                self.n_free_chunks -= 1;
                let bi = self.block_info_mut(block);
                bi.soft_deletions = bi.soft_deletions.saturating_sub(1);
                if let Some(obj) = self.objects.get_mut(tags.obj_id) {
                    obj.n_data_chunks = obj.n_data_chunks.saturating_sub(1);
                    if obj.n_data_chunks == 0 {
                        self.gc.cleanups.push(tags.obj_id);
                    }
                }
                self.delete_chunk(old_chunk);
                continue;
            }

            let file_size = obj.file().map(|f| f.file_size);
            tags.serial_number = tags.serial_number.wrapping_add(1) & 3;
            self.stats.n_gc_copies += 1;

            let new_chunk = if tags.is_header() {
                // the shrink flag and shadowing have done their job
                if let Some(extra) = tags.extra.as_mut() {
                    extra.is_shrink = false;
                    extra.shadows = 0;
                    if let Some(size) = file_size {
                        extra.file_size = size;
                    }
                }
                let data = match ObjectHeader::decode(&buffer) {
                    Ok(mut header) => {
                        header.is_shrink = false;
                        header.shadows = 0;
                        if let Some(size) = file_size {
                            header.file_size = size;
                        }
                        header.encode(buffer.len())?
                    }
                    Err(e) => {
                        warn!("header in chunk {old_chunk} doesn't decode: {e}");
                        buffer.clone()
                    }
                };
                let new_chunk = self.write_new_chunk_with_tags(&data, &tags, true)?;
                if let Some(obj) = self.objects.get_mut(tags.obj_id) {
                    obj.hdr_chunk = new_chunk;
                    obj.serial = tags.serial_number;
                }
                new_chunk
            } else {
                let new_chunk = self.write_new_chunk_with_tags(&buffer, &tags, true)?;
                self.put_chunk_in_file(tags.obj_id, tags.chunk_id, new_chunk, PutMode::Replace)?;
                new_chunk
            };
            trace!("gc moved chunk {old_chunk} to {new_chunk}");
            self.delete_chunk(old_chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::test_support::*;
    use crate::BlockState;

    #[test]
    fn collection_keeps_live_data() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as usize;
        let keep = dev.create_file(crate::OBJECTID_ROOT, "keep", 0o644).unwrap();
        let churn = dev.create_file(crate::OBJECTID_ROOT, "churn", 0o644).unwrap();
        let kept: Vec<u8> = (0..cb * 3).map(|i| (i % 251) as u8).collect();
        dev.write_file(keep, 0, &kept).unwrap();
        // overwrite the same chunk until several blocks are full of stale copies
        for round in 0..(dev.chunks_per_block() * 3) {
            dev.write_file(churn, 0, &vec![round as u8; cb]).unwrap();
        }
        dev.sync(false).unwrap();

        let full: Vec<u32> = dev
            .block_range()
            .filter(|&b| dev.block(b).unwrap().state == BlockState::Full)
            .collect();
        assert!(!full.is_empty());
        let live_before: u32 = dev.block_range().map(|b| dev.block(b).unwrap().live_pages()).sum();
        for block in full {
            if dev.block(block).unwrap().state == BlockState::Full {
                dev.garbage_collect_block(block).unwrap();
                assert_eq!(dev.block(block).unwrap().state, BlockState::Empty);
            }
        }
        let live_after: u32 = dev.block_range().map(|b| dev.block(b).unwrap().live_pages()).sum();
        assert_eq!(live_before, live_after);

        let mut read_back = vec![0u8; kept.len()];
        assert_eq!(dev.read_file(keep, 0, &mut read_back).unwrap(), kept.len());
        assert_eq!(read_back, kept);
        let mut last = vec![0u8; cb];
        dev.read_file(churn, 0, &mut last).unwrap();
        assert!(last.iter().all(|&b| b == (dev.chunks_per_block() * 3 - 1) as u8));
        dev.check_invariants().unwrap();
    }

    #[test]
    fn background_gc_reclaims_stale_blocks() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as usize;
        let f = dev.create_file(crate::OBJECTID_ROOT, "f", 0o644).unwrap();
        for round in 0..(dev.chunks_per_block() * 4) {
            dev.write_file(f, 0, &vec![round as u8; cb]).unwrap();
        }
        let free_before = dev.n_free_chunks();
        for _ in 0..64 {
            dev.background_gc();
        }
        assert_eq!(dev.n_free_chunks(), free_before);
        assert!(dev.stats().background_gc_count >= 64);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn prioritised_block_is_picked_before_dirtier_ones() {
        let mut dev = small_device();
        let (dirty, dirty_chunks) = fill_block(&mut dev, 300);
        let (marked, marked_chunks) = fill_block(&mut dev, 301);
        for &chunk in &dirty_chunks[..10] {
            dev.delete_chunk(chunk);
        }
        dev.delete_chunk(marked_chunks[0]);
        dev.block_info_mut(marked).gc_prioritise = true;
        dev.gc.has_pending_prioritised = true;

        assert_eq!(dev.find_block_for_gc(false, false), Some(marked));
        assert!(dev.gc.has_pending_prioritised);

        // a shrink header holds it back, the oldest dirty block goes first
        dev.block_info_mut(marked).has_shrink_header = true;
        assert_eq!(dev.find_block_for_gc(false, false), Some(dirty));

        // aggressive collection only looks at dirtiness
        dev.block_info_mut(marked).has_shrink_header = false;
        dev.gc.dirtiest = None;
        assert_eq!(dev.find_block_for_gc(true, false), Some(dirty));
    }

    #[test]
    fn oldest_dirty_block_is_taken_after_fruitless_searches() {
        let mut dev = small_device();
        let (block, chunks) = fill_block(&mut dev, 300);
        dev.delete_chunk(chunks[0]);

        // one stale chunk is far from worth a passive collection
        assert_eq!(dev.find_block_for_gc(false, false), None);
        assert_eq!(dev.gc.not_done, 1);

        dev.gc.not_done = 20;
        assert_eq!(dev.find_block_for_gc(false, false), Some(block));
        assert_eq!(dev.stats().oldest_dirty_gc_count, 1);
        assert_eq!(dev.gc.not_done, 0);
    }

    #[test]
    fn failed_collection_leaves_gc_enabled() {
        init_logger();
        let config = crate::DeviceConfig {
            write_attempts: 1,
            ..test_config()
        };
        let mut dev = crate::Device::mount(crate::nand::FaultyNand::new(blank_flash()), config).unwrap();
        // chunks of a live object, so the collector has to copy them
        let f = dev.create_file(crate::OBJECTID_ROOT, "f", 0o644).unwrap();
        let (block, chunks) = fill_block(&mut dev, f);
        dev.delete_chunk(chunks[0]);

        let nand_chunks = dev.block_range().count() as u32 * dev.chunks_per_block();
        dev.nand_mut().fail_writes.extend(0..nand_chunks);
        assert!(dev.garbage_collect_block(block).is_err());
        assert!(!dev.gc.disable);
        assert_eq!(dev.block(block).unwrap().state, BlockState::Full);
    }

    #[test]
    fn collecting_a_block_moves_its_last_live_chunk() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as usize;
        let cpb = dev.chunks_per_block();
        let keep = dev.create_file(crate::OBJECTID_ROOT, "keep", 0o644).unwrap();
        dev.write(keep, 0, &vec![0x5a; cb], true).unwrap();
        let old_chunk = dev.find_chunk(keep, 1).unwrap();
        let (block, _) = dev.split_chunk(old_chunk);

        let scratch = dev.create_file(crate::OBJECTID_ROOT, "scratch", 0o644).unwrap();
        let mut offset = 0u64;
        while dev.block(block).unwrap().pages_in_use < cpb {
            dev.write(scratch, offset, &vec![1; cb], true).unwrap();
            offset += cb as u64;
        }
        assert_eq!(dev.block(block).unwrap().state, BlockState::Full);

        // everything but the data chunk of `keep` moves out or goes away
        dev.unlink(crate::OBJECTID_ROOT, "scratch").unwrap();
        let attrs = dev.attributes(keep).unwrap();
        dev.set_attributes(keep, attrs).unwrap();
        assert_eq!(dev.block(block).unwrap().pages_in_use, 1);

        dev.garbage_collect_block(block).unwrap();
        let new_chunk = dev.find_chunk(keep, 1).unwrap();
        assert_ne!(new_chunk, old_chunk);
        assert_ne!(dev.split_chunk(new_chunk).0, block);
        let bi = dev.block(block).unwrap();
        assert_eq!(bi.pages_in_use, 0);
        assert_eq!(bi.state, BlockState::Empty);

        let mut buf = vec![0u8; cb];
        assert_eq!(dev.read_file(keep, 0, &mut buf).unwrap(), cb);
        assert!(buf.iter().all(|&b| b == 0x5a));
        dev.check_invariants().unwrap();
    }
}

