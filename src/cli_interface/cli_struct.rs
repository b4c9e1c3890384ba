use byte_unit::Byte;
use clap::Parser;

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub enum FlashFsCli {
    /// create a new image of erased flash
    Mkfs(MkfsArgs),
    /// show geometry, free space and counters of an image
    Info(ImageArgs),
    /// list a directory
    Ls(PathArgs),
    /// make a directory
    Mkdir(PathArgs),
    /// copy a host file into the image
    Put(PutArgs),
    /// print a file of the image
    Cat(PathArgs),
    /// remove a file or an empty directory
    Rm(PathArgs),
    /// rename or move an object
    Mv(MvArgs),
    /// collect garbage until no block is worth collecting
    Gc(ImageArgs),
}

/// parse sizes like `64MiB`, `1GB` or plain byte counts
fn parse_size(s: &str) -> Result<u64, String> {
    Byte::from_str(s)
        .map(|b| b.get_bytes() as u64)
        .map_err(|e| e.to_string())
}

///make a new fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(author, version, about = "make a new flash image")]
pub struct MkfsArgs {
    /// the path of the flash image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// the size of the image file
    #[clap(short, long, value_parser = parse_size)]
    pub size: u64,
    /// data bytes in one chunk
    #[clap(short, long, default_value_t = 2048)]
    pub chunk_size: u32,
    /// chunks in one erase block
    #[clap(short = 'b', long, default_value_t = 64)]
    pub chunks_per_block: u32,
}

/// the image to mount and how to mount it
#[derive(clap::Args, Debug, PartialEq)]
pub struct ImageArgs {
    /// the path of the flash image file
    #[clap(short = 'p', long)]
    pub image_file_path: String,
    /// rebuild by scanning blocks in physical order
    #[clap(short, long)]
    pub forward_scan: bool,
    /// ignore any checkpoint and always scan
    #[clap(long)]
    pub no_checkpoint: bool,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct PathArgs {
    #[command(flatten)]
    pub image: ImageArgs,
    /// an absolute path inside the image
    pub path: String,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct PutArgs {
    #[command(flatten)]
    pub image: ImageArgs,
    /// the host file to copy
    pub source: String,
    /// where to put it inside the image
    pub dest: String,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct MvArgs {
    #[command(flatten)]
    pub image: ImageArgs,
    pub from: String,
    pub to: String,
}

/// test the `FlashFsCli` struct
/// test `mkfs` subcommand
#[cfg(test)]
mod mkfs_parse_args_tests {
    use super::*;
    /// test short parameter form
    #[test]
    fn test_short_parameter_form() {
        let args = FlashFsCli::parse_from([
            "flashfs", "mkfs", "-p", "test", "-s", "30", "-c", "512", "-b", "32",
        ]);
        assert_eq!(
            args,
            FlashFsCli::Mkfs(MkfsArgs {
                image_file_path: "test".to_string(),
                size: 30,
                chunk_size: 512,
                chunks_per_block: 32,
            })
        );
    }
    /// test long parameter form, with units and default geometry
    #[test]
    fn test_long_parameter_form() {
        let image_file_path_name = concat!("--", "image-file-path");
        let args = FlashFsCli::parse_from([
            "flashfs",
            "mkfs",
            image_file_path_name,
            "test",
            "--size",
            "2MiB",
        ]);
        assert_eq!(
            args,
            FlashFsCli::Mkfs(MkfsArgs {
                image_file_path: "test".to_string(),
                size: 2 * 1024 * 1024,
                chunk_size: 2048,
                chunks_per_block: 64,
            })
        );
    }
    #[test]
    fn test_bad_size() {
        assert!(FlashFsCli::try_parse_from(["flashfs", "mkfs", "-p", "test", "-s", "lots"]).is_err());
    }
}

/// test the subcommands working on an existing image
#[cfg(test)]
mod image_parse_args_tests {
    use super::*;
    fn image(forward_scan: bool) -> ImageArgs {
        ImageArgs {
            image_file_path: "test".to_string(),
            forward_scan,
            no_checkpoint: false,
        }
    }
    #[test]
    fn test_ls() {
        let args = FlashFsCli::parse_from(["flashfs", "ls", "-p", "test", "/a/b"]);
        assert_eq!(
            args,
            FlashFsCli::Ls(PathArgs {
                image: image(false),
                path: "/a/b".to_string(),
            })
        );
    }
    #[test]
    fn test_put_with_forward_scan() {
        let args = FlashFsCli::parse_from(["flashfs", "put", "-p", "test", "-f", "host.txt", "/x"]);
        assert_eq!(
            args,
            FlashFsCli::Put(PutArgs {
                image: image(true),
                source: "host.txt".to_string(),
                dest: "/x".to_string(),
            })
        );
    }
    #[test]
    fn test_mv() {
        let args = FlashFsCli::parse_from(["flashfs", "mv", "--image-file-path", "test", "/a", "/b"]);
        assert_eq!(
            args,
            FlashFsCli::Mv(MvArgs {
                image: image(false),
                from: "/a".to_string(),
                to: "/b".to_string(),
            })
        );
    }
    #[test]
    fn test_gc_needs_an_image() {
        assert!(FlashFsCli::try_parse_from(["flashfs", "gc"]).is_err());
    }
}
