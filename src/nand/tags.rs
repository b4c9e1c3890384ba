//! per chunk metadata kept in the spare area
use serde::{Deserialize, Serialize};

/// type of a filesystem object, as recorded in headers and tags
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ObjectType {
    #[default]
    Unknown,
    File,
    Symlink,
    Directory,
    Hardlink,
    Special,
}

/// outcome of the ECC check of a read
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EccResult {
    #[default]
    Unknown,
    NoError,
    Fixed,
    Unfixed,
}

/// header fields mirrored into the tags of a header chunk,
/// so a scan can rebuild most objects without reading the chunk body
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderTagInfo {
    pub parent_id: u32,
    pub obj_type: ObjectType,
    pub file_size: u64,
    pub equiv_id: u32,
    pub is_shrink: bool,
    /// id of the object this header shadows, 0 for none
    pub shadows: u32,
}

/// Tags of a chunk, as seen by the filesystem core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedTags {
    /// false for an erased chunk, in which case the other fields are meaningless
    pub chunk_used: bool,
    pub obj_id: u32,
    /// 0 for an object header, 1.. for data
    pub chunk_id: u32,
    pub n_bytes: u32,
    /// per (object, chunk id) write counter, modulo 4
    pub serial_number: u8,
    /// sequence number of the block the chunk was written to
    pub seq_number: u32,
    pub extra: Option<HeaderTagInfo>,
    pub ecc_result: EccResult,
}

/// the part of [ExtendedTags] that is actually stored on flash
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PackedTags {
    pub obj_id: u32,
    pub chunk_id: u32,
    pub n_bytes: u32,
    pub serial_number: u8,
    pub seq_number: u32,
    pub extra: Option<HeaderTagInfo>,
}

impl From<&ExtendedTags> for PackedTags {
    fn from(tags: &ExtendedTags) -> Self {
        PackedTags {
            obj_id: tags.obj_id,
            chunk_id: tags.chunk_id,
            n_bytes: tags.n_bytes,
            serial_number: tags.serial_number & 3,
            seq_number: tags.seq_number,
            extra: tags.extra,
        }
    }
}

impl PackedTags {
    pub fn unpack(self, ecc_result: EccResult) -> ExtendedTags {
        ExtendedTags {
            chunk_used: true,
            obj_id: self.obj_id,
            chunk_id: self.chunk_id,
            n_bytes: self.n_bytes,
            serial_number: self.serial_number,
            seq_number: self.seq_number,
            extra: self.extra,
            ecc_result,
        }
    }
}

impl ExtendedTags {
    pub fn is_header(&self) -> bool {
        self.chunk_id == 0
    }

    pub fn ecc_failed(&self) -> bool {
        self.ecc_result == EccResult::Unfixed
    }
}

/// which of two copies of one logical chunk is the newer write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialOrder {
    /// the candidate directly follows the existing copy
    CandidateNewer,
    /// the existing copy directly follows the candidate
    ExistingNewer,
    /// the serials are equal or two or more steps apart
    Ambiguous,
}

/// `true` when serial `next` is the write right after `prev`, modulo 4
///
/// # Example
/// ```
/// use flashfs::nand::serial_follows;
/// assert!(serial_follows(1, 2));
/// assert!(serial_follows(3, 0));
/// assert!(!serial_follows(2, 1));
/// ```
pub fn serial_follows(prev: u8, next: u8) -> bool {
    prev.wrapping_add(1) & 3 == next & 3
}

/// compare the serial of a `candidate` copy against the `existing` one
pub fn compare_serials(existing: u8, candidate: u8) -> SerialOrder {
    if serial_follows(existing, candidate) {
        SerialOrder::CandidateNewer
    } else if serial_follows(candidate, existing) {
        SerialOrder::ExistingNewer
    } else {
        SerialOrder::Ambiguous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_comparison_wraps() {
        assert_eq!(compare_serials(3, 0), SerialOrder::CandidateNewer);
        assert_eq!(compare_serials(0, 3), SerialOrder::ExistingNewer);
        assert_eq!(compare_serials(1, 3), SerialOrder::Ambiguous);
        assert_eq!(compare_serials(2, 2), SerialOrder::Ambiguous);
    }

    #[test]
    fn packing_masks_serial() {
        let tags = ExtendedTags {
            chunk_used: true,
            obj_id: 42,
            chunk_id: 0,
            serial_number: 6,
            ..Default::default()
        };
        let packed = PackedTags::from(&tags);
        assert_eq!(packed.serial_number, 2);
        let unpacked = packed.unpack(EccResult::NoError);
        assert_eq!(unpacked.obj_id, 42);
        assert!(unpacked.is_header());
    }
}
