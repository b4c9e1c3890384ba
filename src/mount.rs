//! open a flash image file and mount the filesystem inside it
use std::{fs::OpenOptions, path::Path};

use anyhow::{anyhow, Context};
use log::info;
use memmap2::MmapMut;

use crate::{
    nand::{
        image_header::{ImageHeader, IMAGE_HEADER_BYTES},
        FlashImage,
    },
    utils::traits::SerializeAndDigest,
    Device, DeviceConfig, ObjectId, OBJECTID_ROOT,
};

/// a filesystem mounted from a memory mapped image file
pub type ImageDevice = Device<FlashImage<MmapMut>>;

/// mount the filesystem of an image made by [crate::mkfs::mkfs]
/// # Params
/// - `image_path`: the image file
/// - `config`: policies for the mount, the geometry comes from the image header
///
/// # Return
/// the mounted device, owned by the uid and gid recorded at `mkfs` time
pub fn mount<P>(image_path: P, config: DeviceConfig) -> anyhow::Result<ImageDevice>
where
    P: AsRef<Path>,
{
    let image_path = image_path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image_path)
        .with_context(|| format!("opening image {}", image_path.display()))?;
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    if mmap.len() < IMAGE_HEADER_BYTES {
        return Err(anyhow!("{} is too small to be an image", image_path.display()));
    }
    let (mut header, _) = ImageHeader::deserialize(&mmap[..IMAGE_HEADER_BYTES])
        .with_context(|| format!("reading the header of {}", image_path.display()))?;
    header.update_last_mounted_at();
    header.serialize_into(&mut &mut mmap[..IMAGE_HEADER_BYTES])?;

    let nand = FlashImage::new(mmap, IMAGE_HEADER_BYTES, header.geometry)?;
    let mut dev = Device::mount(nand, config)?;
    dev.set_default_owner(header.uid, header.gid);
    info!("image {} mounted", image_path.display());
    Ok(dev)
}

/// unmount, writing a checkpoint, and flush the image to disk
pub fn unmount(dev: ImageDevice) -> anyhow::Result<()> {
    let nand = dev.unmount()?;
    nand.into_inner().flush()?;
    Ok(())
}

/// follow an absolute path from the root directory
pub fn resolve(dev: &mut ImageDevice, path: &str) -> anyhow::Result<ObjectId> {
    let mut id = OBJECTID_ROOT;
    for name in path.split('/').filter(|n| !n.is_empty()) {
        id = dev
            .lookup(id, name)
            .with_context(|| format!("looking up {name} in {path}"))?;
    }
    Ok(id)
}

/// split a path into its parent directory and last name
pub fn resolve_parent<'a>(dev: &mut ImageDevice, path: &'a str) -> anyhow::Result<(ObjectId, &'a str)> {
    let trimmed = path.trim_end_matches('/');
    let (dir, name) = match trimmed.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", trimmed),
    };
    if name.is_empty() {
        return Err(anyhow!("{path} names no object"));
    }
    Ok((resolve(dev, dir)?, name))
}
