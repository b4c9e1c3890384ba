//! in memory objects (inodes) and the table owning them
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::nand::ObjectType;
use crate::utils::time_util::{self, TimeDurationStruct};

use super::tnode::FileTree;
use super::{ObjectId, MAX_NAME_LENGTH, MAX_OBJECT_ID, NOBJECT_BUCKETS};

/// attributes stored in an object header
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: TimeDurationStruct,
    pub mtime: TimeDurationStruct,
    pub ctime: TimeDurationStruct,
    pub rdev: u32,
}

impl Attributes {
    /// attributes of a new object, all times set to now
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = time_util::now();
        Attributes {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
            rdev: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub file_size: u64,
    /// size implied by the data chunks seen while scanning
    pub scanned_size: u64,
    /// smallest size recorded by a shrink header while scanning
    pub shrink_size: u64,
    pub tree: FileTree,
}

impl Default for FileState {
    fn default() -> Self {
        FileState {
            file_size: 0,
            scanned_size: 0,
            shrink_size: u64::MAX,
            tree: FileTree::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirState {
    pub children: BTreeSet<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Unknown,
    File(FileState),
    Directory(DirState),
    Symlink(String),
    Hardlink { equiv_id: ObjectId },
    Special,
}

impl ObjectKind {
    pub fn for_type(obj_type: ObjectType) -> Self {
        match obj_type {
            ObjectType::Unknown => ObjectKind::Unknown,
            ObjectType::File => ObjectKind::File(FileState::default()),
            ObjectType::Directory => ObjectKind::Directory(DirState::default()),
            ObjectType::Symlink => ObjectKind::Symlink(String::new()),
            ObjectType::Hardlink => ObjectKind::Hardlink { equiv_id: 0 },
            ObjectType::Special => ObjectKind::Special,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectKind::Unknown => ObjectType::Unknown,
            ObjectKind::File(_) => ObjectType::File,
            ObjectKind::Directory(_) => ObjectType::Directory,
            ObjectKind::Symlink(_) => ObjectType::Symlink,
            ObjectKind::Hardlink { .. } => ObjectType::Hardlink,
            ObjectKind::Special => ObjectType::Special,
        }
    }
}

/// one filesystem object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub id: ObjectId,
    pub parent: Option<ObjectId>,
    pub kind: ObjectKind,
    /// empty until loaded when the object is lazy loaded
    pub name: String,
    pub sum: u16,
    pub attrs: Attributes,
    /// physical chunk of the newest header, 0 if none was written
    pub hdr_chunk: u32,
    pub serial: u8,
    /// live data chunks of a file
    pub n_data_chunks: u32,
    /// hardlink objects pointing at this one
    pub hard_links: Vec<ObjectId>,
    pub deleted: bool,
    pub soft_deleted: bool,
    pub unlinked: bool,
    /// one of the built in directories, never written unless forced
    pub fake: bool,
    pub rename_allowed: bool,
    pub unlink_allowed: bool,
    /// in memory state newer than the header on flash
    pub dirty: bool,
    /// a header has been seen or written
    pub valid: bool,
    /// name, attributes and alias still have to be read from the header
    pub lazy_loaded: bool,
    /// another object took this one's name through a rename
    pub is_shadowed: bool,
    pub open_handles: u32,
}

impl Object {
    pub fn new(id: ObjectId, kind: ObjectKind) -> Self {
        Object {
            id,
            parent: None,
            kind,
            name: String::new(),
            sum: 0,
            attrs: Attributes::default(),
            hdr_chunk: 0,
            serial: 0,
            n_data_chunks: 0,
            hard_links: Vec::new(),
            deleted: false,
            soft_deleted: false,
            unlinked: false,
            fake: false,
            rename_allowed: true,
            unlink_allowed: true,
            dirty: false,
            valid: false,
            lazy_loaded: false,
            is_shadowed: false,
            open_handles: 0,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.kind.object_type()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ObjectKind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, ObjectKind::File(_))
    }

    pub fn file(&self) -> Option<&FileState> {
        match &self.kind {
            ObjectKind::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileState> {
        match &mut self.kind {
            ObjectKind::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn dir(&self) -> Option<&DirState> {
        match &self.kind {
            ObjectKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirState> {
        match &mut self.kind {
            ObjectKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file().map_or(0, |f| f.file_size)
    }

    pub fn equiv_id(&self) -> ObjectId {
        match self.kind {
            ObjectKind::Hardlink { equiv_id } => equiv_id,
            _ => 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.sum = name_sum(name);
        self.name = name.to_owned();
    }
}

/// positional sum of the bytes of a name, used to skip most string compares
/// # Example
/// ```
/// use flashfs::object::name_sum;
/// assert_eq!(name_sum(""), 0);
/// assert_eq!(name_sum("ab"), 97 + 2 * 98);
/// ```
pub fn name_sum(name: &str) -> u16 {
    name.bytes()
        .take(MAX_NAME_LENGTH)
        .enumerate()
        .fold(0u16, |sum, (i, b)| {
            sum.wrapping_add((b as u16).wrapping_mul(i as u16 + 1))
        })
}

/// Owner of every object, indexed by id, with the per bucket counts
/// used to spread new ids.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    objects: BTreeMap<ObjectId, Object>,
    bucket_counts: Vec<u32>,
    bucket_finder: usize,
}

impl Default for ObjectTable {
    fn default() -> Self {
        ObjectTable {
            objects: BTreeMap::new(),
            bucket_counts: vec![0; NOBJECT_BUCKETS],
            bucket_finder: 0,
        }
    }
}

impl ObjectTable {
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.objects.values_mut()
    }

    pub fn insert(&mut self, object: Object) {
        let bucket = object.id as usize % NOBJECT_BUCKETS;
        if self.objects.insert(object.id, object).is_none() {
            self.bucket_counts[bucket] += 1;
        }
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let removed = self.objects.remove(&id);
        if removed.is_some() {
            let bucket = id as usize % NOBJECT_BUCKETS;
            self.bucket_counts[bucket] = self.bucket_counts[bucket].saturating_sub(1);
        }
        removed
    }

    pub fn clear(&mut self) {
        *self = ObjectTable::default();
    }

    /// a bucket with few objects, found by probing a handful of buckets
    fn find_nice_bucket(&mut self) -> usize {
        let mut lowest = u32::MAX;
        let mut bucket = self.bucket_finder;
        for _ in 0..10 {
            if lowest <= 4 {
                break;
            }
            self.bucket_finder = (self.bucket_finder + 1) % NOBJECT_BUCKETS;
            let count = self.bucket_counts[self.bucket_finder];
            if count < lowest {
                lowest = count;
                bucket = self.bucket_finder;
            }
        }
        bucket
    }

    /// pick an unused object id from a lightly loaded bucket
    pub fn new_object_id(&mut self) -> Option<ObjectId> {
        let bucket = self.find_nice_bucket() as ObjectId;
        let mut id = bucket;
        loop {
            id += NOBJECT_BUCKETS as ObjectId;
            if id > MAX_OBJECT_ID {
                return None;
            }
            if !self.objects.contains_key(&id) {
                return Some(id);
            }
        }
    }
}
