//! errors reported by the flash filesystem core
use thiserror::Error;

/// Errors produced by the NAND boundary and the filesystem core.
///
/// Chunk level variants ([FlashError::EccUnfixed], [FlashError::WriteVerifyFailed],
/// [FlashError::EraseFailed]) are handled by the allocator and the garbage collector,
/// they don't reach callers of the VFS facing operations.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("uncorrectable ECC error on chunk {chunk}")]
    EccUnfixed { chunk: u32 },
    #[error("chunk {chunk} did not read back as written")]
    WriteVerifyFailed { chunk: u32 },
    #[error("erasing block {block} failed")]
    EraseFailed { block: u32 },
    #[error("marking block {block} bad failed")]
    MarkBadFailed { block: u32 },
    #[error("chunk {chunk} is outside of the device")]
    ChunkOutOfRange { chunk: u32 },
    #[error("no space left on device")]
    OutOfSpace,
    #[error("file would grow past the last addressable chunk")]
    FileTooBig,
    #[error("checkpoint rejected: {0}")]
    CorruptCheckpoint(String),
    #[error("object {0} is not attached to the directory tree")]
    HangingObject(u32),
    #[error("duplicate header for object {0}")]
    DuplicateHeader(u32),
    #[error("no such object")]
    NotFound,
    #[error("object already exists")]
    Exists,
    #[error("not a directory")]
    NotDirectory,
    #[error("not a regular file")]
    NotFile,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name too long")]
    NameTooLong,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("no such attribute")]
    NoData,
    #[error("attributes don't fit into the object header")]
    XattrNoSpace,
    #[error("operation not supported")]
    Unsupported,
    #[error("device is not mounted")]
    NotMounted,
    #[error("bad device geometry: {0}")]
    BadGeometry(String),
    #[error("object allocation failed while scanning")]
    ScanAllocation,
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlashError>;

impl FlashError {
    /// the closest `errno` value, for bindings that speak libc
    pub fn errno(&self) -> libc::c_int {
        match self {
            FlashError::OutOfSpace | FlashError::XattrNoSpace => libc::ENOSPC,
            FlashError::FileTooBig => libc::EFBIG,
            FlashError::NotFound => libc::ENOENT,
            FlashError::Exists => libc::EEXIST,
            FlashError::NotDirectory => libc::ENOTDIR,
            FlashError::NotFile => libc::EISDIR,
            FlashError::NotEmpty => libc::ENOTEMPTY,
            FlashError::NameTooLong => libc::ENAMETOOLONG,
            FlashError::NotPermitted => libc::EPERM,
            FlashError::NoData => libc::ENODATA,
            FlashError::Unsupported => libc::ENOTSUP,
            FlashError::BadGeometry(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FlashError::OutOfSpace.errno(), libc::ENOSPC);
        assert_eq!(FlashError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FlashError::FileTooBig.errno(), libc::EFBIG);
        assert_eq!(FlashError::EccUnfixed { chunk: 3 }.errno(), libc::EIO);
    }
}
