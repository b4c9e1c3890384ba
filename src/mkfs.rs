//! create an erased flash image file
use std::{fs::OpenOptions, path::Path};

use anyhow::anyhow;
use byte_unit::{Byte, ByteUnit};
use memmap2::MmapMut;

use crate::{
    nand::{
        flash_image::{ERASED_BYTE, SPARE_BYTES},
        image_header::{ImageHeader, IMAGE_HEADER_BYTES},
        NandGeometry,
    },
    utils::{self, traits::SerializeAndDigest},
};

/// fewest blocks a device can be formatted with: the GC reserve plus some room
pub const MIN_BLOCKS: u32 = 8;

/// create a new image file of erased flash, given its size and NAND geometry
/// # Params
/// - `image_file_path`: the path of the image file, which must not exist yet
/// - `file_size`: the size of the image file, rounded down to whole blocks
/// - `data_bytes_per_chunk`: data bytes in one chunk
/// - `chunks_per_block`: chunks in one erase block
///
/// # Return
/// the geometry that was written into the image header
pub fn mkfs<P>(
    image_file_path: P,
    file_size: u64,
    data_bytes_per_chunk: u32,
    chunks_per_block: u32,
) -> anyhow::Result<NandGeometry>
where
    P: AsRef<Path>,
{
    let block_bytes = utils::geometry_calculator::nand_array_size(
        1,
        chunks_per_block,
        data_bytes_per_chunk,
        SPARE_BYTES,
    );
    if block_bytes == 0 {
        return Err(anyhow!("chunks and blocks must not be empty"));
    }
    // check if specified file_size is enough for the header and the smallest device
    let space_needed = IMAGE_HEADER_BYTES as u64 + MIN_BLOCKS as u64 * block_bytes;
    if file_size < space_needed {
        return Err(anyhow!(
            "File size must be at least {} for chunk size {} and {} chunks per block",
            Byte::from_bytes(space_needed as _).get_appropriate_unit(true),
            Byte::from_bytes(data_bytes_per_chunk as _).get_adjusted_unit(ByteUnit::B),
            chunks_per_block
        ));
    }
    let n_blocks = u32::try_from((file_size - IMAGE_HEADER_BYTES as u64) / block_bytes)?;
    let geometry = NandGeometry {
        data_bytes_per_chunk,
        spare_bytes_per_chunk: SPARE_BYTES,
        chunks_per_block,
        n_blocks,
    };

    // use `users` crate to get the uid and gid of this program
    let uid = users::get_effective_uid();
    let gid = users::get_effective_gid();
    let mut header = ImageHeader::new(geometry, uid, gid)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(image_file_path)?;
    let file_len = IMAGE_HEADER_BYTES as u64 + n_blocks as u64 * block_bytes;
    file.set_len(file_len)?;

    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    mmap[IMAGE_HEADER_BYTES..].fill(ERASED_BYTE);
    header.serialize_into(&mut &mut mmap[..IMAGE_HEADER_BYTES])?;
    mmap.flush()?;
    Ok(geometry)
}
