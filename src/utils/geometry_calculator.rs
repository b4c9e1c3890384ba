//! This module contains functions to calculate derived NAND geometry values

/// number of bits needed to represent `x`
/// # Example
/// ```
/// use flashfs::utils::geometry_calculator::bits_needed;
/// assert_eq!(bits_needed(0), 0);
/// assert_eq!(bits_needed(1), 1);
/// assert_eq!(bits_needed(255), 8);
/// assert_eq!(bits_needed(256), 9);
/// ```
pub const fn bits_needed(x: u32) -> u32 {
    u32::BITS - x.leading_zeros()
}

/// calculate how many low bits of a chunk number a tnode entry drops
/// # Arguments
/// - `end_chunk`: the highest physical chunk number of the device
/// - `tnode_width`: the width of a level-0 tnode entry in bits
/// # Return
/// the chunk group bits, `0` means every tnode entry addresses exactly one chunk
/// # Example
/// ```
/// use flashfs::utils::geometry_calculator::chunk_group_bits;
/// assert_eq!(chunk_group_bits(1023, 32), 0);
/// assert_eq!(chunk_group_bits(1023, 8), 2);
/// ```
pub const fn chunk_group_bits(end_chunk: u32, tnode_width: u32) -> u32 {
    let needed = bits_needed(end_chunk);
    if needed > tnode_width {
        needed - tnode_width
    } else {
        0
    }
}

/// calculate the byte size of a simulated NAND array
/// # Arguments
/// - `n_blocks`: the number of erase blocks
/// - `chunks_per_block`: chunks in one block
/// - `data_bytes`: data bytes of a chunk
/// - `spare_bytes`: out of band bytes of a chunk
/// # Example
/// ```
/// use flashfs::utils::geometry_calculator::nand_array_size;
/// assert_eq!(nand_array_size(4, 32, 512, 64), 4 * 32 * 576);
/// ```
pub const fn nand_array_size(
    n_blocks: u32,
    chunks_per_block: u32,
    data_bytes: u32,
    spare_bytes: u32,
) -> u64 {
    n_blocks as u64 * chunks_per_block as u64 * (data_bytes as u64 + spare_bytes as u64)
}
