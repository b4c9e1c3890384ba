//! the mounted device: owner of every piece of filesystem state
use std::collections::VecDeque;

use log::{info, warn};

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver, NandGeometry};
use crate::utils::geometry_calculator;

use super::bitmap::ChunkBitmap;
use super::block_info::{BlockInfo, BlockState};
use super::cache::ChunkCache;
use super::checkpt_rw::CheckpointState;
use super::config::{DeviceConfig, ScanMode};
use super::gc::GcState;
use super::object::{Object, ObjectTable};
use super::ObjectId;

/// counters describing what the device has been doing
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub n_page_reads: u64,
    pub n_page_writes: u64,
    pub n_erasures: u64,
    pub n_erase_failures: u64,
    pub n_retired_blocks: u64,
    pub n_retried_writes: u64,
    pub n_ecc_fixed: u64,
    pub n_ecc_unfixed: u64,
    pub n_deletions: u64,
    pub n_gc_copies: u64,
    pub n_gc_blocks: u64,
    pub passive_gc_count: u64,
    pub aggressive_gc_count: u64,
    pub background_gc_count: u64,
    pub oldest_dirty_gc_count: u64,
    pub refresh_count: u64,
    pub cache_hits: u64,
    pub checkpoint_saves: u64,
}

/// A mounted flash filesystem on top of a [NandDriver].
///
/// Every operation takes `&mut self`: the borrow checker plays the part of the
/// device lock.
#[derive(Debug)]
pub struct Device<N> {
    pub(crate) nand: N,
    pub(crate) config: DeviceConfig,
    pub(crate) geometry: NandGeometry,
    /// added to NAND block numbers so that chunk 0 is never a valid chunk
    pub(crate) block_offset: u32,
    pub(crate) internal_start_block: u32,
    pub(crate) internal_end_block: u32,
    pub(crate) chunks_per_block: u32,
    pub(crate) data_bytes_per_chunk: u32,
    pub(crate) chunk_group_bits: u32,
    pub(crate) chunk_group_size: u32,

    pub(crate) blocks: Vec<BlockInfo>,
    pub(crate) chunk_bits: ChunkBitmap,
    pub(crate) objects: ObjectTable,

    pub(crate) alloc_block: Option<u32>,
    pub(crate) alloc_page: u32,
    pub(crate) alloc_block_finder: u32,
    pub(crate) seq_number: u32,
    pub(crate) n_erased_blocks: u32,
    /// erased chunks plus chunks that are free but not yet erased
    pub(crate) n_free_chunks: i64,
    pub(crate) n_deleted_files: u32,
    pub(crate) n_unlinked_files: u32,
    pub(crate) n_bg_deletions: u32,

    pub(crate) gc: GcState,
    pub(crate) ckpt: CheckpointState,
    pub(crate) cache: ChunkCache,
    pub(crate) dirty_dirs: VecDeque<ObjectId>,
    /// uid and gid given to objects created without explicit owners
    pub(crate) default_owner: (u32, u32),
    pub(crate) stats: DeviceStats,
}

impl<N: NandDriver> Device<N> {
    fn new(nand: N, config: DeviceConfig) -> Result<Self> {
        let geometry = nand.geometry();
        config.validate(&geometry)?;
        let end_block = config.last_block(&geometry);
        let block_offset = u32::from(config.start_block == 0);
        let internal_start_block = config.start_block + block_offset;
        let internal_end_block = end_block + block_offset;
        let chunks_per_block = geometry.chunks_per_block;
        let end_chunk = (internal_end_block + 1) * chunks_per_block - 1;
        let chunk_group_bits =
            geometry_calculator::chunk_group_bits(end_chunk, config.tnode_width);
        let n_blocks = internal_end_block - internal_start_block + 1;
        let cache = ChunkCache::new(config.n_caches, geometry.data_bytes_per_chunk);
        Ok(Device {
            nand,
            geometry,
            block_offset,
            internal_start_block,
            internal_end_block,
            chunks_per_block,
            data_bytes_per_chunk: geometry.data_bytes_per_chunk,
            chunk_group_bits,
            chunk_group_size: 1 << chunk_group_bits,
            blocks: vec![BlockInfo::default(); n_blocks as usize],
            chunk_bits: ChunkBitmap::new(n_blocks, chunks_per_block),
            objects: ObjectTable::default(),
            alloc_block: None,
            alloc_page: 0,
            alloc_block_finder: internal_start_block,
            seq_number: super::LOWEST_SEQUENCE_NUMBER,
            n_erased_blocks: 0,
            n_free_chunks: 0,
            n_deleted_files: 0,
            n_unlinked_files: 0,
            n_bg_deletions: 0,
            gc: GcState::default(),
            ckpt: CheckpointState::default(),
            cache,
            dirty_dirs: VecDeque::new(),
            default_owner: (0, 0),
            stats: DeviceStats::default(),
            config,
        })
    }

    /// mount the filesystem found on `nand`
    /// # Params
    /// - `nand`: the flash the filesystem lives on
    /// - `config`: geometry subset and policies, see [DeviceConfig]
    /// # Return
    /// the mounted [Device], or an error when the NAND driver fails
    /// or the scan can't allocate the objects it needs
    pub fn mount(nand: N, config: DeviceConfig) -> Result<Self> {
        let mut dev = Device::new(nand, config)?;
        info!(
            "mounting {}: blocks {}..={} of {} chunks, chunk group bits {}",
            dev.config.name,
            dev.internal_start_block,
            dev.internal_end_block,
            dev.chunks_per_block,
            dev.chunk_group_bits
        );
        dev.init_runtime_state()?;
        dev.gc.has_pending_prioritised = true;

        let restored = !dev.config.skip_checkpoint_read && dev.restore_checkpoint();
        if !restored {
            dev.reset_counters();
            dev.init_runtime_state()?;
            match dev.config.scan_mode {
                ScanMode::Backward => dev.scan_backwards()?,
                ScanMode::Forward => dev.scan_forwards()?,
            }
            dev.strip_deleted_objects()?;
            dev.fix_hanging_objects()?;
            if dev.config.empty_lost_and_found {
                dev.empty_lost_and_found()?;
            }
        }
        if !dev.ckpt.is_checkpointed && dev.ckpt.blocks_in_checkpoint > 0 {
            dev.invalidate_checkpoint();
        }
        info!(
            "mounted {} from {}: {} objects, {} free chunks, {} erased blocks",
            dev.config.name,
            if restored { "checkpoint" } else { "scan" },
            dev.objects.len(),
            dev.n_free_chunks,
            dev.n_erased_blocks
        );
        Ok(dev)
    }

    /// flush everything, write a checkpoint if the device gets one,
    /// and hand the NAND back
    pub fn unmount(mut self) -> Result<N> {
        self.sync(true)?;
        info!("unmounted {}", self.config.name);
        Ok(self.nand)
    }

    /// write back cached data and deferred directory headers
    /// # Params
    /// - `checkpoint`: also save a checkpoint
    pub fn sync(&mut self, checkpoint: bool) -> Result<()> {
        self.flush_entire_cache()?;
        self.update_dirty_directories()?;
        if checkpoint {
            self.save_checkpoint();
        }
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.n_erased_blocks = 0;
        self.n_free_chunks = 0;
        self.alloc_block = None;
        self.alloc_page = 0;
        self.n_deleted_files = 0;
        self.n_unlinked_files = 0;
        self.n_bg_deletions = 0;
        self.seq_number = super::LOWEST_SEQUENCE_NUMBER;
    }

    /// fresh block table, bitmap, object table and built in directories
    pub(crate) fn init_runtime_state(&mut self) -> Result<()> {
        let n_blocks = self.n_blocks();
        self.blocks = vec![BlockInfo::default(); n_blocks as usize];
        self.chunk_bits = ChunkBitmap::new(n_blocks, self.chunks_per_block);
        self.alloc_block = None;
        self.alloc_block_finder = self.internal_start_block;
        self.gc = GcState {
            has_pending_prioritised: true,
            refresh_skip: self.config.refresh_period,
            ..GcState::default()
        };
        self.ckpt.blocks_required = 0;
        self.cache.invalidate_all();
        self.dirty_dirs.clear();
        self.objects.clear();
        self.init_fake_directories()
    }
}

/// geometry helpers
impl<N: NandDriver> Device<N> {
    pub(crate) fn n_blocks(&self) -> u32 {
        self.internal_end_block - self.internal_start_block + 1
    }

    pub(crate) fn block_index(&self, block: u32) -> usize {
        (block - self.internal_start_block) as usize
    }

    pub(crate) fn is_valid_block(&self, block: u32) -> bool {
        (self.internal_start_block..=self.internal_end_block).contains(&block)
    }

    pub(crate) fn block_info(&self, block: u32) -> &BlockInfo {
        &self.blocks[self.block_index(block)]
    }

    pub(crate) fn block_info_mut(&mut self, block: u32) -> &mut BlockInfo {
        let index = self.block_index(block);
        &mut self.blocks[index]
    }

    /// `(block, page)` of a physical chunk
    pub(crate) fn split_chunk(&self, chunk: u32) -> (u32, u32) {
        (chunk / self.chunks_per_block, chunk % self.chunks_per_block)
    }

    pub(crate) fn is_valid_chunk(&self, chunk: u32) -> bool {
        self.is_valid_block(chunk / self.chunks_per_block)
    }

    pub(crate) fn chunk_in_use(&self, chunk: u32) -> bool {
        let (block, page) = self.split_chunk(chunk);
        self.is_valid_block(block) && self.chunk_bits.check(self.block_index(block), page as usize)
    }

    pub(crate) fn set_chunk_bit(&mut self, block: u32, page: u32) {
        let index = self.block_index(block);
        self.chunk_bits.set(index, page as usize);
    }

    pub(crate) fn clear_chunk_bit(&mut self, block: u32, page: u32) {
        let index = self.block_index(block);
        self.chunk_bits.clear(index, page as usize);
    }

    pub(crate) fn clear_block_bits(&mut self, block: u32) {
        let index = self.block_index(block);
        self.chunk_bits.clear_block(index);
    }

    pub(crate) fn block_has_chunks(&self, block: u32) -> bool {
        self.chunk_bits.still_some_chunks(self.block_index(block))
    }

    pub(crate) fn new_chunk_buffer(&self) -> Vec<u8> {
        vec![0u8; self.data_bytes_per_chunk as usize]
    }
}

/// NAND access in the device's chunk numbering
impl<N: NandDriver> Device<N> {
    fn nand_chunk(&self, chunk: u32) -> u32 {
        chunk - self.block_offset * self.chunks_per_block
    }

    pub(crate) fn read_chunk(&mut self, chunk: u32, data: Option<&mut [u8]>) -> Result<ExtendedTags> {
        if !self.is_valid_chunk(chunk) {
            return Err(FlashError::ChunkOutOfRange { chunk });
        }
        self.stats.n_page_reads += 1;
        let tags = self.nand.read_chunk_with_tags(self.nand_chunk(chunk), data)?;
        match tags.ecc_result {
            crate::nand::EccResult::Fixed => {
                self.stats.n_ecc_fixed += 1;
                let (block, _) = self.split_chunk(chunk);
                self.handle_chunk_error(block);
            }
            crate::nand::EccResult::Unfixed => {
                self.stats.n_ecc_unfixed += 1;
                warn!("uncorrectable ECC error reading chunk {chunk}");
                let (block, _) = self.split_chunk(chunk);
                self.handle_chunk_error(block);
            }
            _ => {}
        }
        Ok(tags)
    }

    pub(crate) fn write_chunk_raw(
        &mut self,
        chunk: u32,
        data: &[u8],
        tags: &ExtendedTags,
    ) -> Result<()> {
        if !self.is_valid_chunk(chunk) {
            return Err(FlashError::ChunkOutOfRange { chunk });
        }
        self.stats.n_page_writes += 1;
        let nand_chunk = self.nand_chunk(chunk);
        self.nand.write_chunk_with_tags(nand_chunk, data, tags)
    }

    pub(crate) fn erase_block_in_nand(&mut self, block: u32) -> Result<()> {
        self.stats.n_erasures += 1;
        self.nand.erase_block(block - self.block_offset)
    }

    pub(crate) fn mark_block_bad_in_nand(&mut self, block: u32) -> Result<()> {
        self.nand.mark_block_bad(block - self.block_offset)
    }

    pub(crate) fn query_block_in_nand(&mut self, block: u32) -> Result<(BlockState, u32)> {
        self.nand.query_block_state(block - self.block_offset)
    }
}

/// public accessors
impl<N: NandDriver> Device<N> {
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// owner of objects created from now on
    pub fn set_default_owner(&mut self, uid: u32, gid: u32) {
        self.default_owner = (uid, gid);
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn chunks_per_block(&self) -> u32 {
        self.chunks_per_block
    }

    pub fn data_bytes_per_chunk(&self) -> u32 {
        self.data_bytes_per_chunk
    }

    /// first and last block in the device's numbering
    pub fn block_range(&self) -> std::ops::RangeInclusive<u32> {
        self.internal_start_block..=self.internal_end_block
    }

    pub fn block(&self, block: u32) -> Option<BlockInfo> {
        self.is_valid_block(block).then(|| *self.block_info(block))
    }

    /// chunks in use in a block according to the bitmap
    pub fn block_bitmap_count(&self, block: u32) -> u32 {
        if self.is_valid_block(block) {
            self.chunk_bits.count(self.block_index(block))
        } else {
            0
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn n_free_chunks(&self) -> i64 {
        self.n_free_chunks
    }

    pub fn n_erased_blocks(&self) -> u32 {
        self.n_erased_blocks
    }

    pub fn n_deleted_files(&self) -> u32 {
        self.n_deleted_files
    }

    /// objects in the unlinked or deleted directory that aren't freed yet
    pub fn n_unlinked_files(&self) -> u32 {
        self.n_unlinked_files
    }

    pub fn is_checkpointed(&self) -> bool {
        self.ckpt.is_checkpointed
    }

    pub fn blocks_in_checkpoint(&self) -> u32 {
        self.ckpt.blocks_in_checkpoint
    }

    /// the NAND driver, for tools that need to look underneath
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    /// chunks available to new data, after the reserve for garbage collection,
    /// the checkpoint and dirty cache entries are taken off
    pub fn free_space(&mut self) -> u64 {
        let cpb = self.chunks_per_block as i64;
        let mut n_free = self.n_free_chunks + self.n_deleted_files as i64;
        n_free -= self.cache.n_dirty() as i64;
        n_free -= (self.config.n_reserved_blocks as i64 + 1) * cpb;
        n_free -= self.checkpoint_blocks_required() as i64 * cpb;
        n_free.max(0) as u64
    }

    /// [Device::free_space] in bytes
    pub fn free_space_bytes(&mut self) -> u64 {
        self.free_space() * self.data_bytes_per_chunk as u64
    }

    /// free chunks recounted from the block table
    pub fn count_free_chunks(&self) -> i64 {
        self.blocks
            .iter()
            .filter(|bi| bi.state.holds_file_system_chunks())
            .map(|bi| self.chunks_per_block as i64 - bi.pages_in_use as i64 + bi.soft_deletions as i64)
            .sum()
    }

    /// chunks that are erased and ready to be written
    pub fn erased_chunks(&self) -> u32 {
        let mut n = self.n_erased_blocks * self.chunks_per_block;
        if self.alloc_block.is_some() {
            n += self.chunks_per_block - self.alloc_page;
        }
        n
    }
}
