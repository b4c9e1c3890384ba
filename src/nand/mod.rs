//! the NAND boundary: everything the filesystem core needs from flash hardware
pub mod fault;
pub mod flash_image;
pub mod image_header;
pub mod tags;

pub use fault::FaultyNand;
pub use flash_image::FlashImage;
pub use image_header::ImageHeader;
pub use tags::*;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fs::BlockState;

/// physical shape of a NAND array
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandGeometry {
    /// data bytes in one chunk
    pub data_bytes_per_chunk: u32,
    /// out of band bytes in one chunk
    pub spare_bytes_per_chunk: u32,
    pub chunks_per_block: u32,
    pub n_blocks: u32,
}

impl NandGeometry {
    pub fn total_chunks(&self) -> u32 {
        self.n_blocks * self.chunks_per_block
    }
}

/// Chunk level access to a NAND device.
///
/// Chunks and blocks are numbered from 0 in the driver's own address space.
/// A read never fails because of bad data: ECC problems are reported through
/// [ExtendedTags::ecc_result]. Errors are reserved for failures of the
/// operation itself, like a program or erase the chip rejected.
pub trait NandDriver {
    fn geometry(&self) -> NandGeometry;

    /// read the tags of `chunk`, and its data when `data` is given
    fn read_chunk_with_tags(&mut self, chunk: u32, data: Option<&mut [u8]>)
        -> Result<ExtendedTags>;

    /// program `chunk` with `data` and `tags`
    fn write_chunk_with_tags(&mut self, chunk: u32, data: &[u8], tags: &ExtendedTags)
        -> Result<()>;

    fn erase_block(&mut self, block: u32) -> Result<()>;

    fn mark_block_bad(&mut self, block: u32) -> Result<()>;

    fn is_block_bad(&mut self, block: u32) -> Result<bool>;

    /// initial classification of `block` at mount time
    /// # Return
    /// the block state together with the sequence number found in its first chunk
    fn query_block_state(&mut self, block: u32) -> Result<(BlockState, u32)> {
        if self.is_block_bad(block)? {
            return Ok((BlockState::Dead, 0));
        }
        let first_chunk = block * self.geometry().chunks_per_block;
        let tags = self.read_chunk_with_tags(first_chunk, None)?;
        if tags.chunk_used {
            Ok((BlockState::NeedsScanning, tags.seq_number))
        } else {
            Ok((BlockState::Empty, 0))
        }
    }
}

impl<N: NandDriver + ?Sized> NandDriver for Box<N> {
    fn geometry(&self) -> NandGeometry {
        (**self).geometry()
    }

    fn read_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: Option<&mut [u8]>,
    ) -> Result<ExtendedTags> {
        (**self).read_chunk_with_tags(chunk, data)
    }

    fn write_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: &[u8],
        tags: &ExtendedTags,
    ) -> Result<()> {
        (**self).write_chunk_with_tags(chunk, data, tags)
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        (**self).erase_block(block)
    }

    fn mark_block_bad(&mut self, block: u32) -> Result<()> {
        (**self).mark_block_bad(block)
    }

    fn is_block_bad(&mut self, block: u32) -> Result<bool> {
        (**self).is_block_bad(block)
    }

    fn query_block_state(&mut self, block: u32) -> Result<(BlockState, u32)> {
        (**self).query_block_state(block)
    }
}
