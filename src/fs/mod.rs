//! the flash filesystem core
mod alloc;
pub mod bitmap;
pub mod block_info;
mod cache;
mod checkpoint;
mod checkpt_rw;
mod chunk_map;
pub mod config;
mod device;
mod dir;
mod file;
mod gc;
pub mod object;
pub mod object_header;
mod objects;
mod scan;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tnode;
mod verify;
pub mod xattr;

pub use block_info::{BlockInfo, BlockState};
pub use config::{DeviceConfig, ScanMode};
pub use device::{Device, DeviceStats};
pub use dir::{DirEntry, ObjectHandle};
pub use object::{Attributes, Object, ObjectKind};
pub use object_header::ObjectHeader;
pub use verify::InvariantViolation;
pub use xattr::{Xattr, XattrFlags};

pub type ObjectId = u32;

pub const OBJECTID_ROOT: ObjectId = 1;
pub const OBJECTID_LOSTNFOUND: ObjectId = 2;
pub const OBJECTID_UNLINKED: ObjectId = 3;
pub const OBJECTID_DELETED: ObjectId = 4;
/// object id the checkpoint stream is tagged with
pub const OBJECTID_CHECKPOINT_DATA: ObjectId = 0x20;

pub const LOSTNFOUND_NAME: &str = "lost+found";
pub const LOSTNFOUND_MODE: u32 = libc::S_IFDIR | 0o700;

/// sequence number of checkpoint blocks
pub const SEQUENCE_CHECKPOINT_DATA: u32 = 0x21;
/// sequence number written to blocks that could not be marked bad
pub const SEQUENCE_BAD_BLOCK: u32 = 0xFFFF_0000;
pub const LOWEST_SEQUENCE_NUMBER: u32 = 0x0000_1000;
pub const HIGHEST_SEQUENCE_NUMBER: u32 = 0xEFFF_FF00;

pub const MAX_OBJECT_ID: ObjectId = 0x3FFFF;
pub const MAX_CHUNK_ID: u32 = 0xFFFFF;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_ALIAS_LENGTH: usize = 159;
pub const NOBJECT_BUCKETS: usize = 256;

pub const MAX_SHORT_OP_CACHES: u32 = 10;

const GC_PASSIVE_THRESHOLD: u32 = 4;
const GC_GOOD_ENOUGH: u32 = 2;
const MAX_COPIES_PER_PASS: u32 = 5;
/// holes up to this many chunks are filled with zeros instead of a shrink header
const SMALL_HOLE_THRESHOLD: u64 = 4;
