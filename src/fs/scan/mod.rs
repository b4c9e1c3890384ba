//! rebuilding the in memory state from the chunks on flash at mount time
//!
//! Both scans share block classification, header application and the
//! repairs that run once every block has been seen. They differ in the order
//! blocks are visited and in which copy wins when an object or a data chunk
//! shows up more than once.
use log::{debug, info, warn};

use crate::error::Result;
use crate::nand::{ExtendedTags, HeaderTagInfo, NandDriver, ObjectType};

use super::block_info::BlockState;
use super::config::ScanMode;
use super::device::Device;
use super::object::{Object, ObjectKind};
use super::object_header::ObjectHeader;
use super::{
    ObjectId, HIGHEST_SEQUENCE_NUMBER, LOWEST_SEQUENCE_NUMBER, MAX_CHUNK_ID, MAX_OBJECT_ID,
    OBJECTID_DELETED, OBJECTID_LOSTNFOUND, OBJECTID_ROOT, OBJECTID_UNLINKED,
    SEQUENCE_BAD_BLOCK, SEQUENCE_CHECKPOINT_DATA,
};

mod backward;
mod forward;

/// longest parent chain followed before an object is declared hanging
pub(crate) const MAX_PARENT_DEPTH: u32 = 100;

/// what a header chunk says about its object
///
/// Built from the tags alone when they carry the header fields, the body is
/// only read when the scan needs more than that.
#[derive(Debug, Clone)]
struct ScannedHeader {
    obj_type: ObjectType,
    parent_id: ObjectId,
    file_size: u64,
    equiv_id: ObjectId,
    is_shrink: bool,
    shadows: ObjectId,
    body: Option<ObjectHeader>,
}

impl ScannedHeader {
    fn from_tags(info: HeaderTagInfo) -> Self {
        ScannedHeader {
            obj_type: info.obj_type,
            parent_id: info.parent_id,
            file_size: info.file_size,
            equiv_id: info.equiv_id,
            is_shrink: info.is_shrink,
            shadows: info.shadows,
            body: None,
        }
    }

    fn from_body(body: ObjectHeader) -> Self {
        ScannedHeader::from_tags(body.tag_info()).with_body(body)
    }

    fn with_body(mut self, body: ObjectHeader) -> Self {
        self.body = Some(body);
        self
    }

    fn parent_is_unlinked_or_deleted(&self) -> bool {
        self.parent_id == OBJECTID_UNLINKED || self.parent_id == OBJECTID_DELETED
    }

    /// size this header pins the file to and whether older data past it is stale;
    /// a file in the unlinked or deleted directory has no data left
    fn effective_size(&self) -> (u64, bool) {
        if self.parent_is_unlinked_or_deleted() {
            (0, true)
        } else {
            (self.file_size, self.is_shrink)
        }
    }
}

/// a header has already been applied to this object
fn has_header(obj: &Object) -> bool {
    if obj.fake {
        obj.hdr_chunk != 0
    } else {
        obj.valid
    }
}

/// the kind of a scanned object can still be swapped for the one its header names
fn kind_is_replaceable(kind: &ObjectKind) -> bool {
    match kind {
        ObjectKind::File(file) => file.tree.is_empty(),
        ObjectKind::Directory(dir) => dir.children.is_empty(),
        _ => true,
    }
}

/// where a usable chunk found by a scan goes
enum ScannedChunk {
    Header,
    Data,
}

impl<N: NandDriver> Device<N> {
    /// query every block and sort out the ones that need their chunks looked at
    /// # Return
    /// `(block, sequence number)` of every block holding filesystem chunks,
    /// in physical order
    fn classify_blocks(&mut self) -> Result<Vec<(u32, u32)>> {
        let cpb = self.chunks_per_block;
        let mut to_scan = Vec::new();
        self.ckpt.blocks_in_checkpoint = 0;
        for block in self.block_range() {
            self.clear_block_bits(block);
            let (mut state, seq) = self.query_block_in_nand(block)?;
            if seq == SEQUENCE_CHECKPOINT_DATA {
                state = BlockState::Checkpoint;
            } else if seq == SEQUENCE_BAD_BLOCK {
                state = BlockState::Dead;
            }
            let bi = self.block_info_mut(block);
            bi.pages_in_use = 0;
            bi.soft_deletions = 0;
            bi.seq_number = seq;
            bi.state = state;
            match state {
                BlockState::Dead => info!("block {block} is bad"),
                BlockState::Checkpoint => self.ckpt.blocks_in_checkpoint += 1,
                BlockState::Empty => {
                    self.n_erased_blocks += 1;
                    self.n_free_chunks += cpb as i64;
                }
                BlockState::NeedsScanning => {
                    if (LOWEST_SEQUENCE_NUMBER..HIGHEST_SEQUENCE_NUMBER).contains(&seq) {
                        to_scan.push((block, seq));
                        if seq > self.seq_number {
                            self.seq_number = seq;
                        }
                    } else {
                        warn!("block {block} has bad sequence number {seq:#x}, leaving it alone");
                    }
                }
                _ => {}
            }
        }
        debug!(
            "{} blocks to scan, {} erased, {} in the checkpoint",
            to_scan.len(),
            self.n_erased_blocks,
            self.ckpt.blocks_in_checkpoint
        );
        Ok(to_scan)
    }

    /// read a chunk's tags and decide whether its contents can be trusted
    /// # Return
    /// the tags and what the chunk holds, `None` for an erased chunk or one
    /// that is counted as free because it is unreadable or implausible
    fn examine_chunk(&mut self, chunk: u32, block_seq: u32) -> Result<(ExtendedTags, Option<ScannedChunk>)> {
        let tags = self.read_chunk(chunk, None)?;
        if !tags.chunk_used {
            return Ok((tags, None));
        }
        if tags.ecc_failed() {
            warn!("chunk {chunk} is unreadable, treating it as free");
            return Ok((tags, None));
        }
        let plausible = tags.obj_id > 0
            && tags.obj_id <= MAX_OBJECT_ID
            && tags.chunk_id <= MAX_CHUNK_ID
            && (tags.is_header() || tags.n_bytes <= self.data_bytes_per_chunk)
            && tags.seq_number == block_seq;
        if !plausible {
            warn!(
                "chunk {chunk} has implausible tags (object {}, chunk {}, sequence {:#x}), treating it as free",
                tags.obj_id, tags.chunk_id, tags.seq_number
            );
            return Ok((tags, None));
        }
        let kind = if tags.is_header() {
            ScannedChunk::Header
        } else {
            ScannedChunk::Data
        };
        Ok((tags, Some(kind)))
    }

    fn mark_scanned_chunk_in_use(&mut self, chunk: u32) {
        let (block, page) = self.split_chunk(chunk);
        self.set_chunk_bit(block, page);
        self.block_info_mut(block).pages_in_use += 1;
    }

    /// body of a header chunk, `None` when it doesn't decode
    fn read_header_body(&mut self, chunk: u32) -> Result<Option<ObjectHeader>> {
        let mut buffer = self.new_chunk_buffer();
        let tags = self.read_chunk(chunk, Some(&mut buffer))?;
        if tags.ecc_failed() {
            return Ok(None);
        }
        match ObjectHeader::decode(&buffer) {
            Ok(header) => Ok(Some(header)),
            Err(e) => {
                warn!("header in chunk {chunk} does not decode: {e}");
                Ok(None)
            }
        }
    }

    /// assemble what a header chunk says, reading its body when `want_body`
    /// or when the tags don't carry the header fields
    fn scanned_header(&mut self, chunk: u32, tags: &ExtendedTags, want_body: bool) -> Result<Option<ScannedHeader>> {
        match tags.extra {
            Some(info) if !want_body => Ok(Some(ScannedHeader::from_tags(info))),
            Some(info) => {
                let header = ScannedHeader::from_tags(info);
                Ok(Some(match self.read_header_body(chunk)? {
                    Some(body) => header.with_body(body),
                    None => header,
                }))
            }
            None => Ok(self.read_header_body(chunk)?.map(ScannedHeader::from_body)),
        }
    }

    /// the object a header claims to shadow was replaced by a rename;
    /// park it in the unlinked directory so it is deleted once the scan is done
    fn handle_shadowed_object(&mut self, shadowed: ObjectId, mode: ScanMode) -> Result<()> {
        if shadowed <= OBJECTID_DELETED || shadowed > MAX_OBJECT_ID {
            return Ok(());
        }
        // scanning backwards, an existing object was seen in a newer header
        if mode == ScanMode::Backward && self.objects.contains(shadowed) {
            return Ok(());
        }
        let id = self.find_or_create_object(shadowed, ObjectType::File)?;
        debug!("object {id} is shadowed");
        self.add_to_directory(OBJECTID_UNLINKED, id)?;
        let obj = self.obj_mut(id)?;
        obj.is_shadowed = true;
        obj.valid = true;
        if let Some(file) = obj.file_mut() {
            file.shrink_size = 0;
        }
        Ok(())
    }

    /// a header of root or lost+found only carries attributes,
    /// the directory structure of the built in directories is fixed
    fn apply_builtin_dir_header(&mut self, id: ObjectId, chunk: u32, serial: u8, header: &ScannedHeader) -> Result<()> {
        let obj = self.obj_mut(id)?;
        obj.hdr_chunk = chunk;
        obj.serial = serial;
        obj.valid = true;
        match &header.body {
            Some(body) => {
                obj.attrs = body.attrs;
                obj.lazy_loaded = false;
            }
            None => obj.lazy_loaded = true,
        }
        Ok(())
    }

    /// directory a scanned object goes into: its recorded parent when that is a
    /// directory, lost+found otherwise
    fn scanned_parent(&mut self, id: ObjectId, parent_id: ObjectId) -> Result<ObjectId> {
        if parent_id == 0 || parent_id == id || parent_id > MAX_OBJECT_ID {
            warn!("object {id} has bad parent {parent_id}, putting it in lost+found");
            return Ok(OBJECTID_LOSTNFOUND);
        }
        let parent = self.find_or_create_object(parent_id, ObjectType::Directory)?;
        let parent_obj = self.obj_mut(parent)?;
        if parent_obj.kind == ObjectKind::Unknown {
            parent_obj.kind = ObjectKind::for_type(ObjectType::Directory);
        }
        if parent_obj.is_directory() {
            Ok(parent)
        } else {
            warn!("parent {parent} of object {id} is not a directory, putting it in lost+found");
            Ok(OBJECTID_LOSTNFOUND)
        }
    }

    /// fill in an object from the newest header found for it and hang it into its directory
    /// # Params
    /// - `hard_links`: collects hardlinks to be registered with their targets at the end
    fn apply_scanned_header(
        &mut self,
        id: ObjectId,
        chunk: u32,
        serial: u8,
        header: &ScannedHeader,
        mode: ScanMode,
        hard_links: &mut Vec<ObjectId>,
    ) -> Result<()> {
        if header.shadows > 0 {
            self.handle_shadowed_object(header.shadows, mode)?;
        }

        let obj = self.obj_mut(id)?;
        obj.valid = true;
        obj.hdr_chunk = chunk;
        obj.serial = serial;
        obj.dirty = false;
        if obj.object_type() != header.obj_type {
            if kind_is_replaceable(&obj.kind) {
                obj.kind = ObjectKind::for_type(header.obj_type);
            } else {
                warn!(
                    "object {id} was seen as {:?} but its header says {:?}",
                    obj.object_type(),
                    header.obj_type
                );
            }
        }
        match &header.body {
            Some(body) => {
                obj.attrs = body.attrs;
                obj.set_name(&body.name);
                obj.lazy_loaded = false;
                if let ObjectKind::Symlink(alias) = &mut obj.kind {
                    alias.clone_from(&body.alias);
                }
            }
            None => obj.lazy_loaded = true,
        }

        let parent = self.scanned_parent(id, header.parent_id)?;
        self.add_to_directory(parent, id)?;
        let unlinked = parent == OBJECTID_UNLINKED || parent == OBJECTID_DELETED;
        if header.is_shrink {
            let (block, _) = self.split_chunk(chunk);
            self.block_info_mut(block).has_shrink_header = true;
        }

        match header.obj_type {
            ObjectType::File => match mode {
                ScanMode::Backward => {
                    let size = header.file_size;
                    if let Some(file) = self.obj_mut(id)?.file_mut() {
                        if file.scanned_size < size {
                            file.file_size = size;
                            file.scanned_size = size;
                        }
                        file.shrink_size = file.shrink_size.min(size);
                    }
                }
                ScanMode::Forward => {
                    let (size, shrink) = header.effective_size();
                    if shrink {
                        self.prune_resized_chunks(id, size)?;
                    }
                    if let Some(file) = self.obj_mut(id)?.file_mut() {
                        if shrink {
                            file.tree.prune();
                            file.scanned_size = file.scanned_size.min(size);
                            file.file_size = size;
                        } else {
                            file.file_size = size.max(file.scanned_size);
                        }
                    }
                }
            },
            ObjectType::Hardlink => {
                self.obj_mut(id)?.kind = ObjectKind::Hardlink {
                    equiv_id: header.equiv_id,
                };
                if !unlinked {
                    hard_links.push(id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// delete whatever was left in the unlinked and deleted directories
    pub(crate) fn strip_deleted_objects(&mut self) -> Result<()> {
        for dir in [OBJECTID_UNLINKED, OBJECTID_DELETED] {
            let children: Vec<ObjectId> = self
                .obj(dir)?
                .dir()
                .map(|d| d.children.iter().copied().collect())
                .unwrap_or_default();
            for id in children {
                if !self.objects.contains(id) {
                    continue;
                }
                if let Err(e) = self.delete_object(id) {
                    warn!("deleting leftover object {id} failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// an object is hanging when following its parents doesn't lead to root
    fn is_hanging(&self, id: ObjectId) -> bool {
        if matches!(id, OBJECTID_ROOT | OBJECTID_UNLINKED | OBJECTID_DELETED) {
            return false;
        }
        let Some(mut parent) = self
            .objects
            .get(id)
            .and_then(|obj| obj.parent)
            .and_then(|p| self.objects.get(p))
        else {
            return true;
        };
        if !parent.is_directory() {
            return true;
        }
        if matches!(parent.id, OBJECTID_ROOT | OBJECTID_UNLINKED | OBJECTID_DELETED) {
            return false;
        }
        let mut depth = MAX_PARENT_DEPTH;
        while parent.id != OBJECTID_ROOT && depth > 0 {
            match parent.parent.and_then(|p| self.objects.get(p)) {
                Some(grandparent) if grandparent.is_directory() => parent = grandparent,
                _ => break,
            }
            depth -= 1;
        }
        parent.id != OBJECTID_ROOT
    }

    /// move every object that isn't attached to the tree into lost+found
    pub(crate) fn fix_hanging_objects(&mut self) -> Result<()> {
        for id in self.objects.ids() {
            if self.objects.contains(id) && self.is_hanging(id) {
                warn!("object {id} is not attached to the tree, moving it to lost+found");
                self.add_to_directory(OBJECTID_LOSTNFOUND, id)?;
            }
        }
        Ok(())
    }

    fn delete_directory_contents(&mut self, dir: ObjectId) -> Result<()> {
        let children: Vec<ObjectId> = self
            .obj(dir)?
            .dir()
            .map(|d| d.children.iter().copied().collect())
            .unwrap_or_default();
        for id in children {
            if self.objects.get(id).is_some_and(|o| o.is_directory()) {
                self.delete_directory_contents(id)?;
            }
            if let Err(e) = self.unlink_worker(id) {
                warn!("removing object {id} from lost+found failed: {e}");
            }
        }
        Ok(())
    }

    /// throw away everything the scan had to put in lost+found
    pub(crate) fn empty_lost_and_found(&mut self) -> Result<()> {
        info!("emptying lost+found of {}", self.config.name);
        self.delete_directory_contents(OBJECTID_LOSTNFOUND)
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::object_header::ObjectHeader;
    use crate::fs::test_support::*;
    use crate::fs::{Attributes, ScanMode};
    use crate::nand::{ExtendedTags, ObjectType};
    use crate::{OBJECTID_LOSTNFOUND, OBJECTID_ROOT};

    const BOTH_MODES: [ScanMode; 2] = [ScanMode::Backward, ScanMode::Forward];

    /// write a header chunk behind the filesystem's back
    fn raw_header(dev: &mut MemDevice, id: u32, serial: u8, header: &ObjectHeader) -> u32 {
        let bytes = header.encode(TEST_CHUNK_BYTES as usize).unwrap();
        let tags = ExtendedTags {
            obj_id: id,
            chunk_id: 0,
            serial_number: serial,
            extra: Some(header.tag_info()),
            ..ExtendedTags::default()
        };
        dev.write_new_chunk_with_tags(&bytes, &tags, false).unwrap()
    }

    fn raw_data(dev: &mut MemDevice, id: u32, chunk_id: u32, data: &[u8]) -> u32 {
        raw_data_with_serial(dev, id, chunk_id, 0, data)
    }

    fn raw_data_with_serial(dev: &mut MemDevice, id: u32, chunk_id: u32, serial: u8, data: &[u8]) -> u32 {
        let tags = ExtendedTags {
            obj_id: id,
            chunk_id,
            n_bytes: data.len() as u32,
            serial_number: serial,
            ..ExtendedTags::default()
        };
        dev.write_new_chunk_with_tags(data, &tags, false).unwrap()
    }

    fn read_all(dev: &mut MemDevice, id: u32) -> Vec<u8> {
        let mut buf = vec![0u8; dev.file_size(id).unwrap() as usize];
        let n = dev.read_file(id, 0, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn header(obj_type: ObjectType, parent_id: u32, name: &str, mode: u32) -> ObjectHeader {
        ObjectHeader {
            obj_type,
            parent_id,
            name: name.into(),
            attrs: Attributes::new(mode, 0, 0),
            ..ObjectHeader::default()
        }
    }

    fn reaches_root(dev: &MemDevice, mut id: u32) -> bool {
        for _ in 0..16 {
            match dev.object(id).and_then(|o| o.parent) {
                Some(OBJECTID_ROOT) => return true,
                Some(parent) => id = parent,
                None => return false,
            }
        }
        false
    }

    #[test]
    fn flushed_files_survive_a_crash() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let dir = dev.mkdir(OBJECTID_ROOT, "d", 0o755).unwrap();
            let file = dev.create_file(dir, "f", 0o644).unwrap();
            let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
            dev.write_file(file, 0, &data).unwrap();
            dev.flush(file).unwrap();
            dev.sync(false).unwrap();

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            let dir = dev.lookup(OBJECTID_ROOT, "d").unwrap();
            let found = dev.lookup(dir, "f").unwrap();
            assert_eq!(found, file, "{mode:?}");
            assert_eq!(dev.file_size(found).unwrap(), 2000);
            let mut buf = vec![0u8; 2000];
            assert_eq!(dev.read_file(found, 0, &mut buf).unwrap(), 2000);
            assert_eq!(buf, data, "{mode:?}");
        }
    }

    #[test]
    fn newer_serial_wins_between_duplicate_headers() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let first = raw_header(&mut dev, 42, 1, &header(ObjectType::File, OBJECTID_ROOT, "a", 0o600));
            let second = raw_header(&mut dev, 42, 2, &header(ObjectType::File, OBJECTID_ROOT, "b", 0o644));

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.lookup(OBJECTID_ROOT, "b").unwrap(), 42, "{mode:?}");
            assert!(dev.lookup(OBJECTID_ROOT, "a").is_err());
            assert_eq!(dev.attributes(42).unwrap().mode & 0o777, 0o644);
            assert_eq!(dev.object(42).unwrap().hdr_chunk, second);
            assert!(!dev.chunk_in_use(first));
        }
    }

    #[test]
    fn forward_scan_keeps_the_later_of_ambiguous_headers() {
        let mut dev = small_device();
        raw_header(&mut dev, 42, 1, &header(ObjectType::File, OBJECTID_ROOT, "a", 0o600));
        raw_header(&mut dev, 42, 3, &header(ObjectType::File, OBJECTID_ROOT, "b", 0o600));
        let mut dev = crash_and_scan(dev, ScanMode::Forward);
        assert_eq!(dev.lookup(OBJECTID_ROOT, "b").unwrap(), 42);
    }

    #[test]
    fn rewritten_data_chunk_keeps_only_the_newest_copy() {
        let makers: [fn() -> MemDevice; 2] = [small_device, grouped_device];
        for make in makers {
            for mode in BOTH_MODES {
                let mut dev = make();
                let file = dev.create_file(OBJECTID_ROOT, "f", 0o644).unwrap();
                // serials run 1 2 3 0 1 2
                let mut copies = Vec::new();
                for round in 1..=6u8 {
                    dev.write(file, 0, &[round; 300], true).unwrap();
                    copies.push(dev.find_chunk(file, 1).unwrap());
                }
                let newest = *copies.last().unwrap();

                let mut dev = crash_and_scan(dev, mode);
                dev.check_invariants().unwrap();
                assert_eq!(dev.find_chunk(file, 1), Some(newest), "{mode:?}");
                for &old in &copies[..5] {
                    assert!(!dev.chunk_in_use(old), "{mode:?}: copy at {old} survived");
                }
                assert_eq!(dev.read_chunk(newest, None).unwrap().serial_number, 2);
                assert_eq!(read_all(&mut dev, file), vec![6u8; 300], "{mode:?}");
            }
        }
    }

    #[test]
    fn data_serial_wrapping_from_three_to_zero_is_newer() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            raw_header(&mut dev, 60, 1, &ObjectHeader {
                file_size: 3,
                ..header(ObjectType::File, OBJECTID_ROOT, "w", 0o644)
            });
            let old = raw_data_with_serial(&mut dev, 60, 1, 3, b"old");
            let new = raw_data_with_serial(&mut dev, 60, 1, 0, b"new");

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.find_chunk(60, 1), Some(new), "{mode:?}");
            assert!(!dev.chunk_in_use(old));
            assert_eq!(read_all(&mut dev, 60), b"new");
        }
    }

    #[test]
    fn forward_scan_trusts_serials_over_physical_order() {
        let write = || {
            let mut dev = small_device();
            raw_header(&mut dev, 61, 1, &ObjectHeader {
                file_size: 3,
                ..header(ObjectType::File, OBJECTID_ROOT, "r", 0o644)
            });
            // the newer copy sits before the older one
            let new = raw_data_with_serial(&mut dev, 61, 1, 0, b"new");
            let old = raw_data_with_serial(&mut dev, 61, 1, 3, b"old");
            (dev, new, old)
        };

        let (dev, new, old) = write();
        let mut dev = crash_and_scan(dev, ScanMode::Forward);
        dev.check_invariants().unwrap();
        assert_eq!(dev.find_chunk(61, 1), Some(new));
        assert!(!dev.chunk_in_use(old));
        assert_eq!(read_all(&mut dev, 61), b"new");

        // a backward scan only has the order of writing to go by
        let (dev, new, old) = write();
        let mut dev = crash_and_scan(dev, ScanMode::Backward);
        dev.check_invariants().unwrap();
        assert_eq!(dev.find_chunk(61, 1), Some(old));
        assert!(!dev.chunk_in_use(new));
        assert_eq!(read_all(&mut dev, 61), b"old");
    }

    #[test]
    fn orphan_ends_up_in_lost_and_found() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            // the header of directory 300 never made it to flash
            raw_header(&mut dev, 301, 1, &ObjectHeader {
                file_size: 5,
                ..header(ObjectType::File, 300, "f", 0o644)
            });
            raw_data(&mut dev, 301, 1, b"hello");

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.object(301).unwrap().parent, Some(300));
            assert_eq!(dev.object(300).unwrap().parent, Some(OBJECTID_LOSTNFOUND));
            assert_eq!(dev.lookup(300, "f").unwrap(), 301);
            let mut buf = [0u8; 5];
            assert_eq!(dev.read_file(301, 0, &mut buf).unwrap(), 5, "{mode:?}");
            assert_eq!(&buf, b"hello");
        }
    }

    #[test]
    fn directory_cycle_is_broken_through_lost_and_found() {
        let mut dev = small_device();
        raw_header(&mut dev, 310, 1, &header(ObjectType::Directory, 311, "a", 0o755));
        raw_header(&mut dev, 311, 1, &header(ObjectType::Directory, 310, "b", 0o755));

        let dev = crash_and_scan(dev, ScanMode::Backward);
        dev.check_invariants().unwrap();
        assert!(reaches_root(&dev, 310));
        assert!(reaches_root(&dev, 311));
        let parents = [dev.object(310).unwrap().parent, dev.object(311).unwrap().parent];
        assert!(parents.contains(&Some(OBJECTID_LOSTNFOUND)));
    }

    #[test]
    fn lost_and_found_can_be_emptied_at_mount() {
        let mut dev = small_device();
        raw_header(&mut dev, 301, 1, &header(ObjectType::File, 300, "f", 0o644));
        let nand = crash(dev);
        let config = crate::DeviceConfig {
            empty_lost_and_found: true,
            ..test_config()
        };
        let mut dev = crate::Device::mount(nand, config).unwrap();
        dev.check_invariants().unwrap();
        assert!(dev.object(300).is_none());
        assert!(dev.object(301).is_none());
        assert!(dev.read_dir(OBJECTID_LOSTNFOUND).unwrap().is_empty());
    }

    #[test]
    fn truncation_survives_a_crash() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let file = dev.create_file(OBJECTID_ROOT, "f", 0o644).unwrap();
            dev.write_file(file, 0, &[7u8; 2048]).unwrap();
            dev.flush(file).unwrap();
            dev.resize(file, 700).unwrap();

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.file_size(file).unwrap(), 700, "{mode:?}");
            assert!(dev.find_chunk(file, 3).is_none());
            assert!(dev.find_chunk(file, 4).is_none());
            let mut buf = [0u8; 2048];
            assert_eq!(dev.read_file(file, 0, &mut buf).unwrap(), 700);
            assert!(buf[..700].iter().all(|&b| b == 7));
        }
    }

    #[test]
    fn deleted_files_stay_deleted() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let file = dev.create_file(OBJECTID_ROOT, "gone", 0o644).unwrap();
            dev.write_file(file, 0, &[1u8; 1500]).unwrap();
            dev.flush(file).unwrap();
            dev.unlink(OBJECTID_ROOT, "gone").unwrap();

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert!(dev.lookup(OBJECTID_ROOT, "gone").is_err(), "{mode:?}");
            assert!(dev.object(file).is_none());
        }
    }

    #[test]
    fn rename_over_a_file_survives_a_crash() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let a = dev.create_file(OBJECTID_ROOT, "a", 0o644).unwrap();
            let b = dev.create_file(OBJECTID_ROOT, "b", 0o644).unwrap();
            dev.write_file(a, 0, b"new").unwrap();
            dev.write_file(b, 0, b"old").unwrap();
            dev.flush(a).unwrap();
            dev.flush(b).unwrap();
            dev.rename(OBJECTID_ROOT, "a", OBJECTID_ROOT, "b").unwrap();

            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.lookup(OBJECTID_ROOT, "b").unwrap(), a, "{mode:?}");
            assert!(dev.lookup(OBJECTID_ROOT, "a").is_err());
            assert!(dev.object(b).is_none());
            let mut buf = [0u8; 3];
            dev.read_file(a, 0, &mut buf).unwrap();
            assert_eq!(&buf, b"new");
        }
    }

    #[test]
    fn hardlinks_and_symlinks_are_rebuilt() {
        let mut dev = small_device();
        let target = dev.create_file(OBJECTID_ROOT, "t", 0o644).unwrap();
        let link = dev.link(OBJECTID_ROOT, "l", target).unwrap();
        dev.symlink(OBJECTID_ROOT, "s", 0o777, "t").unwrap();
        dev.sync(false).unwrap();

        let mut dev = crash_and_scan(dev, ScanMode::Backward);
        assert_eq!(dev.object(target).unwrap().hard_links, vec![link]);
        let s = dev.lookup(OBJECTID_ROOT, "s").unwrap();
        assert_eq!(dev.read_link(s).unwrap(), "t");
    }

    #[test]
    fn data_written_after_the_header_extends_the_file() {
        for mode in BOTH_MODES {
            let mut dev = small_device();
            let file = dev.create_file(OBJECTID_ROOT, "f", 0o644).unwrap();
            // write through, the header is never rewritten
            dev.write(file, 0, &[3u8; 1024], true).unwrap();
            let mut dev = crash_and_scan(dev, mode);
            dev.check_invariants().unwrap();
            assert_eq!(dev.file_size(file).unwrap(), 1024, "{mode:?}");
        }
    }
}
