use serde::{Deserialize, Serialize};

use crate::utils::{
    digest,
    time_util::{self, *},
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::NandGeometry;

/// magic number of a flash image file
pub const IMAGE_MAGIC: u32 = 0x5941_4646;
/// bytes reserved for the header in front of the NAND array
pub const IMAGE_HEADER_BYTES: usize = 4096;

/// The header of an image file holding a simulated NAND array
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageHeader {
    /// magic number
    pub magic: u32,
    pub geometry: NandGeometry,
    pub created_at: TimeDurationStruct,
    pub last_mounted_at: Option<TimeDurationStruct>,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// to verify the integrity of this header
    /// intend to use a fast secure hash function,like [blake3]
    pub digest: [u8; 32],
}
impl ImageHeader {
    pub fn new(geometry: NandGeometry, uid: u32, gid: u32) -> anyhow::Result<Self> {
        let mut header = Self {
            magic: IMAGE_MAGIC,
            geometry,
            created_at: time_util::now(),
            last_mounted_at: None,
            uid,
            gid,
            digest: [0u8; 32],
        };
        header.digest()?;
        Ok(header)
    }

    pub fn update_last_mounted_at(&mut self) {
        self.last_mounted_at = Some(time_util::now());
    }
}

impl DigestInSelf for ImageHeader {
    fn digest(&mut self) -> anyhow::Result<()> {
        self.digest = [0u8; 32];
        self.digest = digest::digest(self)?;
        Ok(())
    }

    fn verify_digest(&mut self) -> anyhow::Result<bool> {
        // get digest from itself
        let digest = self.digest;
        // clear the digest from struct
        self.digest = [0u8; 32];
        // calulate the digest
        let digest2 = digest::digest(self)?;
        // store newest digest to itself
        self.digest = digest2;
        Ok(digest == digest2 && self.magic == IMAGE_MAGIC)
    }
}

impl SerializeAndDigest for ImageHeader {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::flash_image::SPARE_BYTES;

    fn geometry() -> NandGeometry {
        NandGeometry {
            data_bytes_per_chunk: 2048,
            spare_bytes_per_chunk: SPARE_BYTES,
            chunks_per_block: 64,
            n_blocks: 128,
        }
    }

    #[test]
    fn header_fits_its_slot_and_verifies() {
        let mut header = ImageHeader::new(geometry(), 1000, 1000).unwrap();
        let bytes = SerializeAndDigest::serialize(&mut header).unwrap();
        assert!(bytes.len() < IMAGE_HEADER_BYTES);
        let (decoded, _) = <ImageHeader as SerializeAndDigest>::deserialize(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn tampered_header_is_rejected() {
        let mut header = ImageHeader::new(geometry(), 0, 0).unwrap();
        let mut bytes = SerializeAndDigest::serialize(&mut header).unwrap();
        // first byte of the geometry
        bytes[4] ^= 1;
        assert!(<ImageHeader as SerializeAndDigest>::deserialize(&bytes).is_err());
    }
}
