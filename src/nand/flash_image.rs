//! a NAND array simulated over a byte buffer,
//! either a [Vec] in memory or a memory mapped image file.
//!
//! Every chunk is stored as its data area followed by a spare area:
//! - byte 0: bad block marker (only meaningful in the first chunk of a block)
//! - byte 1: length of the packed tags, `0xff` when the chunk was never programmed
//! - bytes 2..: tags packed with [bincode]
//! - last 8 bytes: [blake3] checksum over data and packed tags, standing in for ECC
use std::ops::Range;

use log::trace;

use crate::error::{FlashError, Result};
use crate::nand::{EccResult, ExtendedTags, NandDriver, NandGeometry, PackedTags};
use crate::utils::digest::short_checksum;

/// spare bytes the simulator needs per chunk
pub const SPARE_BYTES: u32 = 64;
const BAD_BLOCK_OFFSET: usize = 0;
const TAGS_LEN_OFFSET: usize = 1;
const TAGS_OFFSET: usize = 2;
const ECC_BYTES: usize = 8;
pub const ERASED_BYTE: u8 = 0xff;

/// simulated NAND array
#[derive(Debug)]
pub struct FlashImage<T> {
    inner: T,
    /// offset of chunk 0 inside `inner`
    base: usize,
    geometry: NandGeometry,
}

impl<T> FlashImage<T> {
    /// get underlying buffer
    pub fn into_inner(self) -> T {
        self.inner
    }
    /// get read only reference to underlying buffer
    pub const fn get_ref(&self) -> &T {
        &self.inner
    }
    /// get mutable reference to underlying buffer
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl FlashImage<Vec<u8>> {
    /// create an erased NAND array in memory
    pub fn in_memory(
        n_blocks: u32,
        chunks_per_block: u32,
        data_bytes_per_chunk: u32,
    ) -> Self {
        let geometry = NandGeometry {
            data_bytes_per_chunk,
            spare_bytes_per_chunk: SPARE_BYTES,
            chunks_per_block,
            n_blocks,
        };
        let size = crate::utils::geometry_calculator::nand_array_size(
            n_blocks,
            chunks_per_block,
            data_bytes_per_chunk,
            SPARE_BYTES,
        );
        FlashImage {
            inner: vec![ERASED_BYTE; size as usize],
            base: 0,
            geometry,
        }
    }
}

impl<T> FlashImage<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    /// wrap `inner`, whose NAND array starts at byte `base`
    /// # Return
    /// [FlashError::BadGeometry] if the buffer is too small for `geometry`
    pub fn new(inner: T, base: usize, geometry: NandGeometry) -> Result<Self> {
        if geometry.spare_bytes_per_chunk < SPARE_BYTES {
            return Err(FlashError::BadGeometry(format!(
                "spare area of {} bytes is smaller than {SPARE_BYTES}",
                geometry.spare_bytes_per_chunk
            )));
        }
        let needed = base as u64
            + crate::utils::geometry_calculator::nand_array_size(
                geometry.n_blocks,
                geometry.chunks_per_block,
                geometry.data_bytes_per_chunk,
                geometry.spare_bytes_per_chunk,
            );
        if (inner.as_ref().len() as u64) < needed {
            return Err(FlashError::BadGeometry(format!(
                "image holds {} bytes, geometry needs {needed}",
                inner.as_ref().len()
            )));
        }
        Ok(FlashImage {
            inner,
            base,
            geometry,
        })
    }

    fn chunk_stride(&self) -> usize {
        (self.geometry.data_bytes_per_chunk + self.geometry.spare_bytes_per_chunk) as usize
    }

    /// byte ranges of the data and spare areas of `chunk`
    fn chunk_ranges(&self, chunk: u32) -> Result<(Range<usize>, Range<usize>)> {
        if chunk >= self.geometry.total_chunks() {
            return Err(FlashError::ChunkOutOfRange { chunk });
        }
        let start = self.base + chunk as usize * self.chunk_stride();
        let data_end = start + self.geometry.data_bytes_per_chunk as usize;
        let spare_end = data_end + self.geometry.spare_bytes_per_chunk as usize;
        Ok((start..data_end, data_end..spare_end))
    }

    fn block_range(&self, block: u32) -> Result<Range<usize>> {
        if block >= self.geometry.n_blocks {
            return Err(FlashError::BadGeometry(format!("block {block} out of range")));
        }
        let block_bytes = self.chunk_stride() * self.geometry.chunks_per_block as usize;
        let start = self.base + block as usize * block_bytes;
        Ok(start..start + block_bytes)
    }

    /// flip the bits of one data byte of `chunk`, simulating a bit rot
    /// the ECC can't repair
    pub fn corrupt_chunk(&mut self, chunk: u32, offset: usize) -> Result<()> {
        let (data, _) = self.chunk_ranges(chunk)?;
        let index = data.start + offset.min(data.len() - 1);
        let byte = &mut self.inner.as_mut()[index];
        *byte = !*byte;
        Ok(())
    }
}

impl<T> NandDriver for FlashImage<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: Option<&mut [u8]>,
    ) -> Result<ExtendedTags> {
        let (data_range, spare_range) = self.chunk_ranges(chunk)?;
        let bytes = self.inner.as_ref();
        let stored_data = &bytes[data_range];
        if let Some(buf) = data {
            let n = buf.len().min(stored_data.len());
            buf[..n].copy_from_slice(&stored_data[..n]);
        }
        let spare = &bytes[spare_range];
        let tags_len = spare[TAGS_LEN_OFFSET];
        if tags_len == ERASED_BYTE {
            return Ok(ExtendedTags {
                ecc_result: EccResult::NoError,
                ..Default::default()
            });
        }
        let ecc_start = spare.len() - ECC_BYTES;
        let tags_end = (TAGS_OFFSET + tags_len as usize).min(ecc_start);
        let packed_bytes = &spare[TAGS_OFFSET..tags_end];
        let ecc_ok = short_checksum(&[stored_data, packed_bytes])[..] == spare[ecc_start..];
        let decoded: std::result::Result<(PackedTags, usize), _> =
            bincode::serde::decode_from_slice(packed_bytes, bincode::config::legacy());
        let tags = match (decoded, ecc_ok) {
            (Ok((packed, _)), true) => packed.unpack(EccResult::NoError),
            (Ok((packed, _)), false) => packed.unpack(EccResult::Unfixed),
            (Err(_), _) => ExtendedTags {
                chunk_used: true,
                ecc_result: EccResult::Unfixed,
                ..Default::default()
            },
        };
        if tags.ecc_failed() {
            trace!("ecc failure reading chunk {chunk}");
        }
        Ok(tags)
    }

    fn write_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: &[u8],
        tags: &ExtendedTags,
    ) -> Result<()> {
        let (data_range, spare_range) = self.chunk_ranges(chunk)?;
        let packed = bincode::serde::encode_to_vec(PackedTags::from(tags), bincode::config::legacy())?;
        let spare_len = spare_range.len();
        if TAGS_OFFSET + packed.len() > spare_len - ECC_BYTES {
            return Err(FlashError::BadGeometry("tags don't fit the spare area".into()));
        }
        let mut page = vec![ERASED_BYTE; data_range.len()];
        let n = data.len().min(page.len());
        page[..n].copy_from_slice(&data[..n]);
        let mut spare = vec![ERASED_BYTE; spare_len];
        spare[TAGS_LEN_OFFSET] = packed.len() as u8;
        spare[TAGS_OFFSET..TAGS_OFFSET + packed.len()].copy_from_slice(&packed);
        let ecc = short_checksum(&[&page, &packed]);
        spare[spare_len - ECC_BYTES..].copy_from_slice(&ecc);

        // programming can only clear bits
        let bytes = self.inner.as_mut();
        for (dst, src) in bytes[data_range].iter_mut().zip(page.iter()) {
            *dst &= *src;
        }
        for (dst, src) in bytes[spare_range].iter_mut().zip(spare.iter()) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        let range = self.block_range(block)?;
        self.inner.as_mut()[range].fill(ERASED_BYTE);
        Ok(())
    }

    fn mark_block_bad(&mut self, block: u32) -> Result<()> {
        let (_, spare) = self.chunk_ranges(block * self.geometry.chunks_per_block)?;
        self.inner.as_mut()[spare.start + BAD_BLOCK_OFFSET] = 0;
        Ok(())
    }

    fn is_block_bad(&mut self, block: u32) -> Result<bool> {
        let (_, spare) = self.chunk_ranges(block * self.geometry.chunks_per_block)?;
        Ok(self.inner.as_ref()[spare.start + BAD_BLOCK_OFFSET] != ERASED_BYTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::BlockState;
    use crate::nand::{HeaderTagInfo, ObjectType};

    fn header_tags() -> ExtendedTags {
        ExtendedTags {
            chunk_used: true,
            obj_id: 0x101,
            chunk_id: 0,
            n_bytes: 0,
            serial_number: 1,
            seq_number: 0x1001,
            extra: Some(HeaderTagInfo {
                parent_id: 1,
                obj_type: ObjectType::File,
                file_size: 1 << 33,
                equiv_id: 0,
                is_shrink: true,
                shadows: 0x3ffff,
            }),
            ecc_result: EccResult::NoError,
        }
    }

    #[test]
    fn erased_chunk_reads_unused() {
        let mut nand = FlashImage::in_memory(2, 4, 512);
        let mut buf = vec![0u8; 512];
        let tags = nand.read_chunk_with_tags(3, Some(&mut buf)).unwrap();
        assert!(!tags.chunk_used);
        assert!(buf.iter().all(|b| *b == 0xff));
        assert_eq!(nand.query_block_state(0).unwrap(), (BlockState::Empty, 0));
    }

    #[test]
    fn largest_tags_fit_spare_area() {
        let mut nand = FlashImage::in_memory(2, 4, 512);
        let tags = header_tags();
        nand.write_chunk_with_tags(4, &[7u8; 100], &tags).unwrap();
        let mut buf = vec![0u8; 512];
        let read = nand.read_chunk_with_tags(4, Some(&mut buf)).unwrap();
        assert_eq!(read, tags);
        assert_eq!(&buf[..100], &[7u8; 100]);
        assert!(buf[100..].iter().all(|b| *b == 0xff));
        assert_eq!(
            nand.query_block_state(1).unwrap(),
            (BlockState::NeedsScanning, 0x1001)
        );
    }

    #[test]
    fn corruption_is_reported_as_unfixed() {
        let mut nand = FlashImage::in_memory(1, 4, 512);
        nand.write_chunk_with_tags(1, &[1u8; 512], &header_tags()).unwrap();
        nand.corrupt_chunk(1, 17).unwrap();
        let tags = nand.read_chunk_with_tags(1, None).unwrap();
        assert!(tags.chunk_used);
        assert_eq!(tags.ecc_result, EccResult::Unfixed);
    }

    #[test]
    fn rewriting_a_programmed_chunk_corrupts_it() {
        let mut nand = FlashImage::in_memory(1, 4, 512);
        nand.write_chunk_with_tags(0, &[0x0f; 512], &header_tags()).unwrap();
        nand.write_chunk_with_tags(0, &[0xf0; 512], &header_tags()).unwrap();
        let mut buf = vec![0u8; 512];
        let tags = nand.read_chunk_with_tags(0, Some(&mut buf)).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(tags.ecc_result, EccResult::Unfixed);
    }

    #[test]
    fn erase_and_bad_marks() {
        let mut nand = FlashImage::in_memory(2, 4, 512);
        nand.write_chunk_with_tags(5, &[0u8; 512], &header_tags()).unwrap();
        nand.erase_block(1).unwrap();
        assert!(!nand.read_chunk_with_tags(5, None).unwrap().chunk_used);
        nand.mark_block_bad(1).unwrap();
        assert!(nand.is_block_bad(1).unwrap());
        assert!(!nand.is_block_bad(0).unwrap());
        assert_eq!(nand.query_block_state(1).unwrap(), (BlockState::Dead, 0));
    }

    #[test]
    fn buffer_must_hold_the_geometry() {
        let geometry = NandGeometry {
            data_bytes_per_chunk: 512,
            spare_bytes_per_chunk: SPARE_BYTES,
            chunks_per_block: 4,
            n_blocks: 2,
        };
        assert!(FlashImage::new(vec![0xffu8; 100], 0, geometry).is_err());
        assert!(FlashImage::new(vec![0xffu8; 2 * 4 * 576 + 16], 16, geometry).is_ok());
    }
}
