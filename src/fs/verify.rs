//! consistency checks over the whole in memory state
use thiserror::Error;

use crate::nand::NandDriver;

use super::device::Device;
use super::ObjectId;

/// a broken invariant found by [Device::check_invariants]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("block {block}: {bitmap} chunks set in the bitmap but {pages} pages in use")]
    BitmapMismatch { block: u32, bitmap: u32, pages: u32 },
    #[error("{recorded} free chunks recorded but {counted} counted from the block table")]
    FreeCount { recorded: i64, counted: i64 },
    #[error("object {obj} maps chunk {chunk_id} to tree entry {entry}, which holds no live chunk")]
    DeadDataChunk { obj: ObjectId, chunk_id: u32, entry: u32 },
    #[error("header chunk {chunk} of object {obj} is not in use")]
    DeadHeaderChunk { obj: ObjectId, chunk: u32 },
    #[error("object {obj} names {parent} as parent, which doesn't list it")]
    NotAChild { obj: ObjectId, parent: ObjectId },
    #[error("directory {dir} lists {child}, whose parent is elsewhere")]
    StrayChild { dir: ObjectId, child: ObjectId },
}

impl<N: NandDriver> Device<N> {
    /// check the bookkeeping that every operation has to keep intact:
    /// bitmap and block table agree, the free chunk count adds up, every mapped
    /// chunk is live and parent and child links point at each other
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for block in self.block_range() {
            let bitmap = self.block_bitmap_count(block);
            let pages = self.block_info(block).pages_in_use;
            if bitmap != pages {
                return Err(InvariantViolation::BitmapMismatch { block, bitmap, pages });
            }
        }

        let counted = self.count_free_chunks();
        if counted != self.n_free_chunks {
            return Err(InvariantViolation::FreeCount {
                recorded: self.n_free_chunks,
                counted,
            });
        }

        for obj in self.objects.values() {
            if obj.hdr_chunk != 0 && !self.chunk_in_use(obj.hdr_chunk) {
                return Err(InvariantViolation::DeadHeaderChunk {
                    obj: obj.id,
                    chunk: obj.hdr_chunk,
                });
            }
            if let Some(file) = obj.file() {
                for (chunk_id, entry) in file.tree.entries() {
                    let base = entry << self.chunk_group_bits;
                    let live = (base..base + self.chunk_group_size).any(|c| self.chunk_in_use(c));
                    if !live {
                        return Err(InvariantViolation::DeadDataChunk {
                            obj: obj.id,
                            chunk_id,
                            entry,
                        });
                    }
                }
            }
            if let Some(parent) = obj.parent {
                let listed = self
                    .objects
                    .get(parent)
                    .and_then(|p| p.dir())
                    .is_some_and(|d| d.children.contains(&obj.id));
                if !listed {
                    return Err(InvariantViolation::NotAChild { obj: obj.id, parent });
                }
            }
            if let Some(dir) = obj.dir() {
                for &child in &dir.children {
                    if self.objects.get(child).and_then(|c| c.parent) != Some(obj.id) {
                        return Err(InvariantViolation::StrayChild { dir: obj.id, child });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InvariantViolation;
    use crate::fs::test_support::*;
    use crate::OBJECTID_ROOT;

    #[test]
    fn fresh_device_is_consistent() {
        let dev = small_device();
        dev.check_invariants().unwrap();
        assert_eq!(
            dev.n_free_chunks(),
            (TEST_BLOCKS * TEST_CHUNKS_PER_BLOCK) as i64
        );
    }

    #[test]
    fn a_skewed_free_count_is_reported() {
        let mut dev = small_device();
        let file = dev.create_file(OBJECTID_ROOT, "f", 0o644).unwrap();
        dev.write_file(file, 0, &[1u8; 100]).unwrap();
        dev.flush(file).unwrap();
        dev.check_invariants().unwrap();
        dev.n_free_chunks += 1;
        assert!(matches!(
            dev.check_invariants(),
            Err(InvariantViolation::FreeCount { .. })
        ));
    }

    #[test]
    fn a_lost_bitmap_bit_is_reported() {
        let mut dev = small_device();
        let file = dev.create_file(OBJECTID_ROOT, "f", 0o644).unwrap();
        let hdr = dev.object(file).unwrap().hdr_chunk;
        let (block, page) = dev.split_chunk(hdr);
        dev.clear_chunk_bit(block, page);
        assert!(dev.block_bitmap_count(block) < dev.block(block).unwrap().pages_in_use);
        assert!(matches!(
            dev.check_invariants(),
            Err(InvariantViolation::BitmapMismatch { block: b, .. }) if b == block
        ));
    }
}
