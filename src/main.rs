use std::io::Write;

use anyhow::anyhow;
use byte_unit::Byte;
use clap::Parser;
use flashfs::{
    cli_interface::{FlashFsCli, ImageArgs},
    mount::{self, ImageDevice},
    nand::ObjectType,
    DeviceConfig, ScanMode,
};
use log::info;

/// idle collections `gc` runs at most before giving up
const MAX_GC_ROUNDS: u32 = 1000;

/// a CLI to create flash images and work on the filesystem inside them.
///
/// Every subcommand except `mkfs` mounts the image, does its work and
/// unmounts again, leaving a checkpoint behind for the next mount.
fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = FlashFsCli::parse();
    match args {
        FlashFsCli::Mkfs(args) => {
            let geometry = flashfs::mkfs::mkfs(
                &args.image_file_path,
                args.size,
                args.chunk_size,
                args.chunks_per_block,
            )?;
            println!(
                "{}: {} blocks of {} chunks of {}",
                args.image_file_path,
                geometry.n_blocks,
                geometry.chunks_per_block,
                Byte::from_bytes(geometry.data_bytes_per_chunk as _).get_appropriate_unit(true)
            );
        }
        FlashFsCli::Info(args) => {
            let mut dev = open(&args)?;
            let blocks = dev.block_range();
            println!(
                "blocks {}..={} of {} chunks of {}",
                blocks.start(),
                blocks.end(),
                dev.chunks_per_block(),
                Byte::from_bytes(dev.data_bytes_per_chunk() as _).get_appropriate_unit(true)
            );
            println!(
                "free {}, {} erased blocks, {} objects",
                Byte::from_bytes(dev.free_space_bytes() as _).get_appropriate_unit(true),
                dev.n_erased_blocks(),
                dev.n_objects()
            );
            println!("{:#?}", dev.stats());
            mount::unmount(dev)?;
        }
        FlashFsCli::Ls(args) => {
            let mut dev = open(&args.image)?;
            let dir = mount::resolve(&mut dev, &args.path)?;
            for entry in dev.read_dir(dir)? {
                let size = dev.file_size(entry.id)?;
                let kind = match entry.obj_type {
                    ObjectType::Directory => 'd',
                    ObjectType::Symlink => 'l',
                    ObjectType::Hardlink => 'h',
                    ObjectType::Special => 's',
                    _ => '-',
                };
                println!("{kind} {:>6} {:>10} {}", entry.id, size, entry.name);
            }
            mount::unmount(dev)?;
        }
        FlashFsCli::Mkdir(args) => {
            let mut dev = open(&args.image)?;
            let (parent, name) = mount::resolve_parent(&mut dev, &args.path)?;
            dev.mkdir(parent, name, 0o755)?;
            mount::unmount(dev)?;
        }
        FlashFsCli::Put(args) => {
            let data = std::fs::read(&args.source)?;
            let mut dev = open(&args.image)?;
            let (parent, name) = mount::resolve_parent(&mut dev, &args.dest)?;
            let file = dev.create_file(parent, name, 0o644)?;
            let written = dev.write_file(file, 0, &data)?;
            if written < data.len() {
                mount::unmount(dev)?;
                return Err(anyhow!("no space: wrote {written} of {} bytes", data.len()));
            }
            dev.flush(file)?;
            info!("put {} bytes into {}", written, args.dest);
            mount::unmount(dev)?;
        }
        FlashFsCli::Cat(args) => {
            let mut dev = open(&args.image)?;
            let file = mount::resolve(&mut dev, &args.path)?;
            let mut buf = vec![0u8; dev.file_size(file)? as usize];
            let n = dev.read_file(file, 0, &mut buf)?;
            std::io::stdout().write_all(&buf[..n])?;
            mount::unmount(dev)?;
        }
        FlashFsCli::Rm(args) => {
            let mut dev = open(&args.image)?;
            let (parent, name) = mount::resolve_parent(&mut dev, &args.path)?;
            let id = dev.lookup(parent, name)?;
            if dev.object_type(id)? == ObjectType::Directory {
                dev.rmdir(parent, name)?;
            } else {
                dev.unlink(parent, name)?;
            }
            mount::unmount(dev)?;
        }
        FlashFsCli::Mv(args) => {
            let mut dev = open(&args.image)?;
            let (old_dir, old_name) = mount::resolve_parent(&mut dev, &args.from)?;
            let (new_dir, new_name) = mount::resolve_parent(&mut dev, &args.to)?;
            dev.rename(old_dir, old_name, new_dir, new_name)?;
            mount::unmount(dev)?;
        }
        FlashFsCli::Gc(args) => {
            let mut dev = open(&args)?;
            let mut rounds = 1;
            while !dev.background_gc() && rounds < MAX_GC_ROUNDS {
                rounds += 1;
            }
            println!(
                "{rounds} rounds, {} erased blocks, {} collected in all",
                dev.n_erased_blocks(),
                dev.stats().n_gc_blocks
            );
            mount::unmount(dev)?;
        }
    }
    Ok(())
}

fn open(args: &ImageArgs) -> anyhow::Result<ImageDevice> {
    let config = DeviceConfig {
        scan_mode: if args.forward_scan {
            ScanMode::Forward
        } else {
            ScanMode::Backward
        },
        skip_checkpoint_read: args.no_checkpoint,
        ..DeviceConfig::default()
    };
    mount::mount(&args.image_file_path, config)
}
