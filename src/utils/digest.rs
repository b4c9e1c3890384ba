use bincode::config;
use serde::Serialize;

/// cacluate [blake3] hash of a serilizeable object
pub fn digest<T: Serialize>(t: &T) -> anyhow::Result<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    let config = config::legacy();
    hasher.update(&bincode::serde::encode_to_vec(t, config)?);
    Ok(*hasher.finalize().as_bytes())
}

/// short [blake3] checksum over several byte slices,
/// used as the ECC of a simulated NAND chunk
pub fn short_checksum(parts: &[&[u8]]) -> [u8; 8] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 8];
    hasher.finalize_xof().fill(&mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_checksum_depends_on_every_part() {
        let a = short_checksum(&[b"data", b"tags"]);
        let b = short_checksum(&[b"data", b"tagz"]);
        assert_ne!(a, b);
        assert_eq!(a, short_checksum(&[b"data", b"tags"]));
    }
}
