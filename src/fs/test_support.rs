//! devices and helpers shared by the unit tests of the core
use crate::nand::{ExtendedTags, FaultyNand, FlashImage, NandDriver};

use super::{Device, DeviceConfig, ScanMode};

pub type MemDevice = Device<FlashImage<Vec<u8>>>;

pub const TEST_BLOCKS: u32 = 32;
pub const TEST_CHUNKS_PER_BLOCK: u32 = 16;
pub const TEST_CHUNK_BYTES: u32 = 512;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// configuration small enough for every feature, checkpoints included, to kick in
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        name: "test".into(),
        n_reserved_blocks: 3,
        checkpoint_min_blocks: 16,
        refresh_period: 0,
        ..DeviceConfig::default()
    }
}

pub fn blank_flash() -> FlashImage<Vec<u8>> {
    FlashImage::in_memory(TEST_BLOCKS, TEST_CHUNKS_PER_BLOCK, TEST_CHUNK_BYTES)
}

/// a freshly mounted blank device
pub fn small_device() -> MemDevice {
    device_with(|_| {})
}

/// a blank device with a tweaked configuration
pub fn device_with(tweak: impl FnOnce(&mut DeviceConfig)) -> MemDevice {
    init_logger();
    let mut config = test_config();
    tweak(&mut config);
    Device::mount(blank_flash(), config).unwrap()
}

/// tnodes too narrow for the chunk numbers, so entries name chunk groups
pub fn grouped_device() -> MemDevice {
    device_with(|c| c.tnode_width = 8)
}

pub fn faulty_device() -> Device<FaultyNand<FlashImage<Vec<u8>>>> {
    init_logger();
    Device::mount(FaultyNand::new(blank_flash()), test_config()).unwrap()
}

/// clean unmount and mount again with the same configuration
pub fn remount<N: NandDriver>(dev: Device<N>) -> Device<N> {
    remount_with(dev, |_| {})
}

pub fn remount_with<N: NandDriver>(dev: Device<N>, tweak: impl FnOnce(&mut DeviceConfig)) -> Device<N> {
    let mut config = dev.config().clone();
    tweak(&mut config);
    let nand = dev.unmount().unwrap();
    Device::mount(nand, config).unwrap()
}

/// drop the device without syncing anything, as a power loss would
pub fn crash<N: NandDriver>(dev: Device<N>) -> N {
    dev.nand
}

/// power loss followed by a mount that has to scan
pub fn crash_and_scan<N: NandDriver>(dev: Device<N>, mode: ScanMode) -> Device<N> {
    let config = DeviceConfig {
        scan_mode: mode,
        ..dev.config().clone()
    };
    Device::mount(crash(dev), config).unwrap()
}

/// fill a fresh block with data chunks of `obj_id` that no file maps
/// # Return
/// the block and its chunks, in page order
pub fn fill_block<N: NandDriver>(dev: &mut Device<N>, obj_id: u32) -> (u32, Vec<u32>) {
    dev.skip_rest_of_block();
    let chunks: Vec<u32> = (1..=dev.chunks_per_block())
        .map(|chunk_id| {
            let tags = ExtendedTags {
                obj_id,
                chunk_id,
                n_bytes: 1,
                ..ExtendedTags::default()
            };
            dev.write_new_chunk_with_tags(&[chunk_id as u8], &tags, false).unwrap()
        })
        .collect();
    let (block, _) = dev.split_chunk(chunks[0]);
    assert!(chunks.iter().all(|&c| dev.split_chunk(c).0 == block));
    (block, chunks)
}
