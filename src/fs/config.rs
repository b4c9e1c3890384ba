//! tunables of a mounted device
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::nand::NandGeometry;

use super::MAX_SHORT_OP_CACHES;

/// how a mount without a usable checkpoint rebuilds its state
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// blocks in physical order, duplicates resolved by serial number
    Forward,
    /// blocks newest first by sequence number, first copy seen wins
    #[default]
    Backward,
}

/// Mount time configuration of a [Device](super::Device).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// first NAND block used by the filesystem
    pub start_block: u32,
    /// last NAND block used by the filesystem, `None` for the last block of the chip
    pub end_block: Option<u32>,
    /// erased blocks kept back for garbage collection, at least 2
    pub n_reserved_blocks: u32,
    /// entries of the short operation chunk cache, 0 disables it
    pub n_caches: u32,
    /// write whole aligned chunks straight to flash instead of through the cache
    pub cache_bypass_aligned: bool,
    /// bits of a level-0 tnode entry; narrower than the chunk numbers means chunk groups
    pub tnode_width: u32,
    pub scan_mode: ScanMode,
    pub skip_checkpoint_read: bool,
    pub skip_checkpoint_write: bool,
    /// smallest device, in blocks, that gets checkpoints
    pub checkpoint_min_blocks: u32,
    /// garbage collections between two refresh collections, below 10 disables refresh
    pub refresh_period: u32,
    /// delete whatever a scan had to put into lost+found
    pub empty_lost_and_found: bool,
    /// queue parent directory header rewrites until the next sync
    pub defer_dir_update: bool,
    /// check every chunk is erased before writing it
    pub always_check_erased: bool,
    /// attempts at writing one chunk before giving up, 0 for no limit
    pub write_attempts: u32,
    pub disable_lazy_load: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: "flashfs".into(),
            start_block: 0,
            end_block: None,
            n_reserved_blocks: 5,
            n_caches: 10,
            cache_bypass_aligned: true,
            tnode_width: 32,
            scan_mode: ScanMode::Backward,
            skip_checkpoint_read: false,
            skip_checkpoint_write: false,
            checkpoint_min_blocks: 60,
            refresh_period: 500,
            empty_lost_and_found: false,
            defer_dir_update: false,
            always_check_erased: false,
            write_attempts: 5 * 64,
            disable_lazy_load: false,
        }
    }
}

impl DeviceConfig {
    /// last NAND block of the filesystem on a chip of `geometry`
    pub fn last_block(&self, geometry: &NandGeometry) -> u32 {
        self.end_block
            .unwrap_or_else(|| geometry.n_blocks.saturating_sub(1))
    }

    /// reject configurations the core can't run with
    pub fn validate(&self, geometry: &NandGeometry) -> Result<()> {
        let end_block = self.last_block(geometry);
        if geometry.chunks_per_block < 2 || geometry.data_bytes_per_chunk < 512 {
            return Err(FlashError::BadGeometry(format!(
                "need at least 2 chunks of 512 bytes per block, got {} chunks of {} bytes",
                geometry.chunks_per_block, geometry.data_bytes_per_chunk
            )));
        }
        if end_block >= geometry.n_blocks || self.start_block >= end_block {
            return Err(FlashError::BadGeometry(format!(
                "block range {}..={end_block} doesn't fit a chip of {} blocks",
                self.start_block, geometry.n_blocks
            )));
        }
        if self.n_reserved_blocks < 2 {
            return Err(FlashError::BadGeometry(
                "at least 2 reserved blocks are needed".into(),
            ));
        }
        let n_blocks = end_block - self.start_block + 1;
        if n_blocks < self.n_reserved_blocks + 2 {
            return Err(FlashError::BadGeometry(format!(
                "{n_blocks} blocks leave nothing besides {} reserved ones",
                self.n_reserved_blocks
            )));
        }
        if self.n_caches > MAX_SHORT_OP_CACHES {
            return Err(FlashError::BadGeometry(format!(
                "at most {MAX_SHORT_OP_CACHES} cache entries are supported"
            )));
        }
        if !(8..=32).contains(&self.tnode_width) {
            return Err(FlashError::BadGeometry(format!(
                "tnode width {} is outside 8..=32",
                self.tnode_width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(n_blocks: u32) -> NandGeometry {
        NandGeometry {
            data_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 64,
            chunks_per_block: 32,
            n_blocks,
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate(&geometry(64)).is_ok());
        assert_eq!(config.last_block(&geometry(64)), 63);
    }

    #[test]
    fn inconsistent_configs_are_rejected() {
        let config = DeviceConfig {
            n_reserved_blocks: 1,
            ..Default::default()
        };
        assert!(config.validate(&geometry(64)).is_err());

        let config = DeviceConfig {
            end_block: Some(64),
            ..Default::default()
        };
        assert!(config.validate(&geometry(64)).is_err());

        let config = DeviceConfig {
            tnode_width: 4,
            ..Default::default()
        };
        assert!(config.validate(&geometry(64)).is_err());

        assert!(DeviceConfig::default().validate(&geometry(6)).is_err());
    }
}
