use std::io::Write;

use anyhow::anyhow;
use serde::{de::DeserializeOwned, Serialize};

/// a record that carries a digest of its own contents, like the image header
pub trait DigestInSelf {
    /// recompute the stored digest
    fn digest(&mut self) -> anyhow::Result<()>;
    /// check the stored digest against the contents
    fn verify_digest(&mut self) -> anyhow::Result<bool>;
}

/// bincode (legacy encoding) persistence of a [DigestInSelf] record:
/// the digest is refreshed on every write and verified on every read
pub trait SerializeAndDigest: Serialize + DeserializeOwned + DigestInSelf {
    /// serialize into a writer implementing [Write](std::io::Write)
    /// # Returns
    /// The number of bytes written if successful
    fn serialize_into<W>(&mut self, w: &mut W) -> anyhow::Result<usize>
    where
        W: Write,
    {
        self.digest()?;
        let config = bincode::config::legacy();
        bincode::serde::encode_into_std_write(self, w, config).map_err(|e| e.into())
    }

    fn serialize(&mut self) -> anyhow::Result<Vec<u8>> {
        self.digest()?;
        let config = bincode::config::legacy();
        bincode::serde::encode_to_vec(self, config).map_err(|e| e.into())
    }

    /// deserialize from the start of a slice, trailing bytes are ignored
    /// # Returns
    /// A tuple containing the deserialized object and the number of bytes read
    fn deserialize(buf: &[u8]) -> anyhow::Result<(Self, usize)> {
        let config = bincode::config::legacy();
        let (mut object, bytes_read): (Self, usize) =
            bincode::serde::decode_from_slice(buf, config)?;
        if !object.verify_digest()? {
            return Err(anyhow!("digest mismatch, the record is corrupt"));
        }
        Ok((object, bytes_read))
    }
}
