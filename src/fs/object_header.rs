//! the object header: chunk 0 of every object
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::nand::{HeaderTagInfo, ObjectType};

use super::object::Attributes;
use super::xattr::Xattr;
use super::ObjectId;

/// headers larger than a chunk are impossible anyway, this bounds decoding of garbage
const HEADER_DECODE_LIMIT: usize = 1 << 16;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectHeader {
    pub obj_type: ObjectType,
    pub parent_id: ObjectId,
    pub name: String,
    pub attrs: Attributes,
    pub file_size: u64,
    /// target of a hardlink
    pub equiv_id: ObjectId,
    /// target of a symlink
    pub alias: String,
    /// written by a truncation or a deletion
    pub is_shrink: bool,
    /// id of an object this header replaced through a rename
    pub shadows: ObjectId,
    pub xattrs: Vec<Xattr>,
}

impl ObjectHeader {
    /// encode into the data area of a chunk of `chunk_bytes`
    pub fn encode(&self, chunk_bytes: usize) -> Result<Vec<u8>> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::legacy())?;
        if bytes.len() > chunk_bytes {
            return Err(FlashError::XattrNoSpace);
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let config = bincode::config::legacy().with_limit::<HEADER_DECODE_LIMIT>();
        let (header, _) = bincode::serde::decode_from_slice(bytes, config)?;
        Ok(header)
    }

    /// the fields mirrored into the tags of the header chunk
    pub fn tag_info(&self) -> HeaderTagInfo {
        HeaderTagInfo {
            parent_id: self.parent_id,
            obj_type: self.obj_type,
            file_size: self.file_size,
            equiv_id: self.equiv_id,
            is_shrink: self.is_shrink,
            shadows: self.shadows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_info_mirrors_header() {
        let header = ObjectHeader {
            obj_type: ObjectType::File,
            parent_id: 1,
            name: "f".into(),
            file_size: 1234,
            is_shrink: true,
            shadows: 300,
            ..Default::default()
        };
        let info = header.tag_info();
        assert_eq!(info.parent_id, 1);
        assert_eq!(info.file_size, 1234);
        assert!(info.is_shrink);
        assert_eq!(info.shadows, 300);
        let bytes = header.encode(512).unwrap();
        assert_eq!(ObjectHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn oversized_header_is_refused() {
        let header = ObjectHeader {
            xattrs: vec![Xattr {
                name: "user.big".into(),
                value: vec![0; 600],
            }],
            ..Default::default()
        };
        assert!(matches!(header.encode(512), Err(FlashError::XattrNoSpace)));
    }

    #[test]
    fn erased_chunk_is_not_a_header() {
        assert!(ObjectHeader::decode(&[0xff; 512]).is_err());
    }
}
