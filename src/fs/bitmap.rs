use bitvec::prelude::*;

/// "chunk in use" bits of every block of the device
///
/// blocks are addressed by their index in the device's block table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: BitVec<u8, Lsb0>,
    chunks_per_block: usize,
}

impl ChunkBitmap {
    pub fn new(n_blocks: u32, chunks_per_block: u32) -> Self {
        ChunkBitmap {
            bits: bitvec![u8, Lsb0; 0; n_blocks as usize * chunks_per_block as usize],
            chunks_per_block: chunks_per_block as usize,
        }
    }

    /// bytes needed to dump the bitmap of one block
    pub fn stride(&self) -> usize {
        self.chunks_per_block.div_ceil(8)
    }

    fn block_bits(&self, block: usize) -> &BitSlice<u8, Lsb0> {
        let start = block * self.chunks_per_block;
        &self.bits[start..start + self.chunks_per_block]
    }

    fn block_bits_mut(&mut self, block: usize) -> &mut BitSlice<u8, Lsb0> {
        let start = block * self.chunks_per_block;
        &mut self.bits[start..start + self.chunks_per_block]
    }

    /// check if chunk is in use
    /// # Params
    /// - `block`: block index
    /// - `chunk`: chunk inside that block, start at 0
    pub fn check(&self, block: usize, chunk: usize) -> bool {
        self.block_bits(block)
            .get(chunk)
            .as_deref()
            .copied()
            .unwrap_or(false)
    }

    pub fn set(&mut self, block: usize, chunk: usize) {
        self.block_bits_mut(block).set(chunk, true);
    }

    pub fn clear(&mut self, block: usize, chunk: usize) {
        self.block_bits_mut(block).set(chunk, false);
    }

    /// release every chunk of a block
    pub fn clear_block(&mut self, block: usize) {
        self.block_bits_mut(block).fill(false);
    }

    /// calculate the number of chunks in use in a block
    pub fn count(&self, block: usize) -> u32 {
        self.block_bits(block).count_ones() as u32
    }

    /// check if any chunk of the block is in use
    pub fn still_some_chunks(&self, block: usize) -> bool {
        self.block_bits(block).any()
    }

    /// dump the bits of one block, padded to [ChunkBitmap::stride] bytes
    pub fn block_bytes(&self, block: usize) -> Vec<u8> {
        let mut out = vec![0u8; self.stride()];
        let view = out.view_bits_mut::<Lsb0>();
        view[..self.chunks_per_block].copy_from_bitslice(self.block_bits(block));
        out
    }

    /// restore the bits of one block from [ChunkBitmap::block_bytes] output
    pub fn load_block_bytes(&mut self, block: usize, bytes: &[u8]) {
        let n = self.chunks_per_block;
        let view = bytes.view_bits::<Lsb0>();
        self.block_bits_mut(block).copy_from_bitslice(&view[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_check_and_count() {
        let mut bitmap = ChunkBitmap::new(3, 12);
        bitmap.set(1, 0);
        bitmap.set(1, 11);
        assert!(bitmap.check(1, 0));
        assert!(bitmap.check(1, 11));
        assert!(!bitmap.check(0, 11));
        assert!(!bitmap.check(2, 0));
        assert_eq!(bitmap.count(1), 2);
        assert!(!bitmap.still_some_chunks(0));

        bitmap.clear(1, 0);
        assert_eq!(bitmap.count(1), 1);
        bitmap.clear_block(1);
        assert!(!bitmap.still_some_chunks(1));
    }

    #[test]
    fn out_of_block_chunk_reads_unused() {
        let bitmap = ChunkBitmap::new(2, 8);
        assert!(!bitmap.check(0, 9));
    }

    #[test]
    fn block_dump_restores_bits() {
        let mut bitmap = ChunkBitmap::new(2, 12);
        bitmap.set(1, 3);
        bitmap.set(1, 10);
        let bytes = bitmap.block_bytes(1);
        assert_eq!(bytes.len(), 2);

        let mut restored = ChunkBitmap::new(2, 12);
        restored.load_block_bytes(1, &bytes);
        assert_eq!(restored, bitmap);
    }
}
