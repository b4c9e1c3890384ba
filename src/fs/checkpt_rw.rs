//! the checkpoint byte stream, laid over whole erase blocks
//!
//! Checkpoint chunks are tagged with [OBJECTID_CHECKPOINT_DATA], a chunk id
//! counting the chunks of the stream from 1, and the reserved
//! [SEQUENCE_CHECKPOINT_DATA], so a scan never mistakes them for file data.
use log::{debug, trace, warn};

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver};

use super::block_info::BlockState;
use super::device::Device;
use super::{OBJECTID_CHECKPOINT_DATA, SEQUENCE_CHECKPOINT_DATA};

#[derive(Debug, Default, Clone)]
pub(crate) struct CheckpointState {
    /// the checkpoint on flash matches the state in memory
    pub is_checkpointed: bool,
    pub blocks_in_checkpoint: u32,
    /// blocks a checkpoint of the current state takes, 0 when unknown
    pub blocks_required: u32,
}

impl<N: NandDriver> Device<N> {
    /// next empty block after `after` a checkpoint may be written to
    fn find_erased_checkpoint_block(&self, after: Option<u32>) -> Option<u32> {
        let from = after.map_or(self.internal_start_block, |b| b + 1);
        (from..=self.internal_end_block).find(|&b| self.block_info(b).state == BlockState::Empty)
    }

    /// write `bytes` as a new checkpoint stream
    ///
    /// The blocks written to are taken out of the free pool even when the
    /// write fails half way, so that invalidation erases them again.
    pub(crate) fn write_checkpoint_stream(&mut self, bytes: &[u8]) -> Result<()> {
        let cpb = self.chunks_per_block;
        let chunk_bytes = self.data_bytes_per_chunk as usize;
        let mut blocks = Vec::new();
        let mut page = cpb;
        let mut result = Ok(());

        for (i, piece) in bytes.chunks(chunk_bytes).enumerate() {
            if page == cpb {
                match self.find_erased_checkpoint_block(blocks.last().copied()) {
                    Some(block) => {
                        debug!("checkpoint continues in block {block}");
                        blocks.push(block);
                        page = 0;
                    }
                    None => {
                        result = Err(FlashError::OutOfSpace);
                        break;
                    }
                }
            }
            let block = blocks[blocks.len() - 1];
            let tags = ExtendedTags {
                chunk_used: true,
                obj_id: OBJECTID_CHECKPOINT_DATA,
                chunk_id: i as u32 + 1,
                n_bytes: piece.len() as u32,
                seq_number: SEQUENCE_CHECKPOINT_DATA,
                ..ExtendedTags::default()
            };
            let mut buffer = self.new_chunk_buffer();
            buffer[..piece.len()].copy_from_slice(piece);
            if let Err(e) = self.write_chunk_raw(block * cpb + page, &buffer, &tags) {
                warn!("writing checkpoint chunk {} failed: {e}", i + 1);
                result = Err(e);
                break;
            }
            trace!("checkpoint chunk {} in block {block} page {page}", i + 1);
            page += 1;
        }
        self.claim_checkpoint_blocks(&blocks);
        result
    }

    /// move `blocks` out of the free pool into the checkpoint
    pub(crate) fn claim_checkpoint_blocks(&mut self, blocks: &[u32]) {
        for &block in blocks {
            if self.block_info(block).state == BlockState::Empty {
                self.n_erased_blocks = self.n_erased_blocks.saturating_sub(1);
                self.n_free_chunks -= self.chunks_per_block as i64;
            }
            let bi = self.block_info_mut(block);
            bi.state = BlockState::Checkpoint;
            bi.seq_number = SEQUENCE_CHECKPOINT_DATA;
        }
        self.ckpt.blocks_in_checkpoint = blocks.len() as u32;
    }

    /// read back the checkpoint stream
    /// # Return
    /// the bytes and the blocks they came from, `None` when there is no checkpoint
    pub(crate) fn read_checkpoint_stream(&mut self) -> Result<Option<(Vec<u8>, Vec<u32>)>> {
        let mut blocks = Vec::new();
        for block in self.block_range() {
            let (state, seq) = self.query_block_in_nand(block)?;
            if state != BlockState::Dead && seq == SEQUENCE_CHECKPOINT_DATA {
                blocks.push(block);
            }
        }
        if blocks.is_empty() {
            return Ok(None);
        }
        debug!("checkpoint blocks {blocks:?}");

        let mut bytes = Vec::new();
        let mut expected_chunk_id = 1;
        let mut buffer = self.new_chunk_buffer();
        for &block in &blocks {
            for page in 0..self.chunks_per_block {
                let chunk = block * self.chunks_per_block + page;
                let tags = self.read_chunk(chunk, Some(&mut buffer))?;
                if !tags.chunk_used {
                    break;
                }
                if tags.ecc_failed() {
                    return Err(FlashError::CorruptCheckpoint(format!(
                        "chunk {chunk} unreadable"
                    )));
                }
                if tags.obj_id != OBJECTID_CHECKPOINT_DATA || tags.chunk_id != expected_chunk_id {
                    return Err(FlashError::CorruptCheckpoint(format!(
                        "chunk {chunk} holds stream chunk {} of object {}, expected chunk {expected_chunk_id}",
                        tags.chunk_id, tags.obj_id
                    )));
                }
                let n = (tags.n_bytes as usize).min(buffer.len());
                bytes.extend_from_slice(&buffer[..n]);
                expected_chunk_id += 1;
            }
        }
        Ok(Some((bytes, blocks)))
    }

    /// erase every checkpoint block, retiring those that refuse
    pub(crate) fn erase_checkpoint_blocks(&mut self) {
        self.ckpt.blocks_in_checkpoint = 0;
        let blocks: Vec<u32> = self
            .block_range()
            .filter(|&b| self.block_info(b).state == BlockState::Checkpoint)
            .collect();
        for block in blocks {
            debug!("erasing checkpoint block {block}");
            match self.erase_block_in_nand(block) {
                Ok(()) => {
                    let bi = self.block_info_mut(block);
                    bi.state = BlockState::Empty;
                    bi.seq_number = 0;
                    bi.pages_in_use = 0;
                    bi.soft_deletions = 0;
                    bi.skip_erased_check = true;
                    self.n_erased_blocks += 1;
                    self.n_free_chunks += self.chunks_per_block as i64;
                    self.clear_block_bits(block);
                }
                Err(e) => {
                    self.stats.n_erase_failures += 1;
                    warn!("erasing checkpoint block {block} failed: {e}");
                    self.retire_block(block);
                }
            }
        }
        self.ckpt.blocks_required = 0;
    }
}
