//! object lifecycle: creation, headers, directory membership and deletion
use log::{debug, trace, warn};

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver, ObjectType};
use crate::utils::time_util;

use super::device::Device;
use super::object::{Attributes, DirState, Object, ObjectKind};
use super::object_header::ObjectHeader;
use super::xattr::{apply_xattr_mod, XattrMod};
use super::{
    ObjectId, LOSTNFOUND_MODE, LOSTNFOUND_NAME, OBJECTID_DELETED, OBJECTID_LOSTNFOUND,
    OBJECTID_ROOT, OBJECTID_UNLINKED,
};

const ROOT_MODE: u32 = libc::S_IFDIR | 0o755;

/// which header fields an update changes
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeaderUpdate<'a> {
    pub name: Option<&'a str>,
    /// write even a built in directory
    pub force: bool,
    pub is_shrink: bool,
    pub shadows: ObjectId,
    pub xattr: Option<&'a XattrMod>,
}

impl<N: NandDriver> Device<N> {
    pub(crate) fn obj(&self, id: ObjectId) -> Result<&Object> {
        self.objects.get(id).ok_or(FlashError::NotFound)
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.objects.get_mut(id).ok_or(FlashError::NotFound)
    }

    fn create_fake_directory(&mut self, id: ObjectId, mode: u32) {
        let mut dir = Object::new(id, ObjectKind::Directory(DirState::default()));
        dir.fake = true;
        dir.valid = true;
        dir.rename_allowed = false;
        dir.unlink_allowed = false;
        dir.attrs = Attributes::new(mode, 0, 0);
        self.objects.insert(dir);
    }

    /// root, lost+found and the two hidden directories unlinked and deleted objects live in
    pub(crate) fn init_fake_directories(&mut self) -> Result<()> {
        self.create_fake_directory(OBJECTID_UNLINKED, 0);
        self.create_fake_directory(OBJECTID_DELETED, 0);
        self.create_fake_directory(OBJECTID_ROOT, ROOT_MODE);
        self.create_fake_directory(OBJECTID_LOSTNFOUND, LOSTNFOUND_MODE);
        self.obj_mut(OBJECTID_LOSTNFOUND)?.set_name(LOSTNFOUND_NAME);
        self.add_to_directory(OBJECTID_ROOT, OBJECTID_LOSTNFOUND)
    }

    /// a new object with a fresh id, or `id` when given; parked in lost+found
    pub(crate) fn create_new_object(
        &mut self,
        id: Option<ObjectId>,
        obj_type: ObjectType,
    ) -> Result<ObjectId> {
        let id = match id {
            Some(id) => id,
            None => self.objects.new_object_id().ok_or(FlashError::OutOfSpace)?,
        };
        let mut obj = Object::new(id, ObjectKind::for_type(obj_type));
        obj.attrs = Attributes::new(0, 0, 0);
        self.objects.insert(obj);
        self.ckpt.blocks_required = 0;
        if id != OBJECTID_ROOT && id != OBJECTID_LOSTNFOUND && self.objects.contains(OBJECTID_LOSTNFOUND) {
            self.add_to_directory(OBJECTID_LOSTNFOUND, id)?;
        }
        trace!("created object {id} of type {obj_type:?}");
        Ok(id)
    }

    /// the object `id`, created with `obj_type` when it doesn't exist yet
    pub(crate) fn find_or_create_object(
        &mut self,
        id: ObjectId,
        obj_type: ObjectType,
    ) -> Result<ObjectId> {
        if id > 0 && self.objects.contains(id) {
            return Ok(id);
        }
        self.create_new_object((id > 0).then_some(id), obj_type)
    }

    pub(crate) fn free_object(&mut self, id: ObjectId) {
        if let Some(obj) = self.objects.remove(id) {
            if obj.unlinked {
                self.n_unlinked_files = self.n_unlinked_files.saturating_sub(1);
            }
            if let ObjectKind::Hardlink { equiv_id } = obj.kind {
                if let Some(equiv) = self.objects.get_mut(equiv_id) {
                    equiv.hard_links.retain(|&hl| hl != id);
                }
            }
            self.dirty_dirs.retain(|&d| d != id);
        }
        self.ckpt.blocks_required = 0;
    }

    /// register every hardlink in `links` with the object it points at
    pub(crate) fn hardlink_fixup(&mut self, links: &[ObjectId]) {
        for &hl in links {
            let Some(equiv_id) = self.objects.get(hl).map(|o| o.equiv_id()) else {
                continue;
            };
            match self.objects.get_mut(equiv_id) {
                Some(equiv) if equiv_id != hl => {
                    if !equiv.hard_links.contains(&hl) {
                        equiv.hard_links.push(hl);
                    }
                }
                _ => warn!("hardlink {hl} points at missing object {equiv_id}"),
            }
        }
    }

    /// move an object into directory `dir_id`
    pub(crate) fn add_to_directory(&mut self, dir_id: ObjectId, id: ObjectId) -> Result<()> {
        if !self.obj(dir_id)?.is_directory() {
            return Err(FlashError::NotDirectory);
        }
        self.remove_from_directory(id);
        if let Some(dir) = self.obj_mut(dir_id)?.dir_mut() {
            dir.children.insert(id);
        }
        let obj = self.obj_mut(id)?;
        obj.parent = Some(dir_id);
        if (dir_id == OBJECTID_UNLINKED || dir_id == OBJECTID_DELETED) && !obj.unlinked {
            obj.unlinked = true;
            obj.rename_allowed = false;
            self.n_unlinked_files += 1;
        }
        Ok(())
    }

    pub(crate) fn remove_from_directory(&mut self, id: ObjectId) {
        let Some(parent) = self.objects.get_mut(id).and_then(|obj| obj.parent.take()) else {
            return;
        };
        if let Some(dir) = self.objects.get_mut(parent).and_then(|p| p.dir_mut()) {
            dir.children.remove(&id);
        }
    }

    /// child of `dir_id` called `name`
    pub(crate) fn find_by_name(&mut self, dir_id: ObjectId, name: &str) -> Result<Option<ObjectId>> {
        let dir = self.obj(dir_id)?;
        let children: Vec<ObjectId> = dir
            .dir()
            .ok_or(FlashError::NotDirectory)?
            .children
            .iter()
            .copied()
            .collect();
        let sum = super::object::name_sum(name);
        for child in children {
            if self.obj(child)?.lazy_loaded {
                self.load_object_details(child)?;
            }
            let obj = self.obj(child)?;
            if obj.sum == sum && obj.name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// the object a hardlink points at, or the object itself
    pub(crate) fn equivalent(&self, id: ObjectId) -> ObjectId {
        match self.objects.get(id).map(|o| &o.kind) {
            Some(ObjectKind::Hardlink { equiv_id }) if self.objects.contains(*equiv_id) => *equiv_id,
            _ => id,
        }
    }

    /// decode the newest header of an object
    pub(crate) fn read_object_header(&mut self, id: ObjectId) -> Result<Option<ObjectHeader>> {
        let hdr_chunk = self.obj(id)?.hdr_chunk;
        if hdr_chunk == 0 {
            return Ok(None);
        }
        let mut buffer = self.new_chunk_buffer();
        let tags = self.read_chunk(hdr_chunk, Some(&mut buffer))?;
        if tags.ecc_failed() {
            warn!("header of object {id} in chunk {hdr_chunk} is unreadable");
            return Ok(None);
        }
        Ok(Some(ObjectHeader::decode(&buffer)?))
    }

    /// fill in name, attributes and alias of a lazily loaded object
    pub(crate) fn load_object_details(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.obj(id)?;
        if !obj.lazy_loaded || obj.hdr_chunk == 0 {
            return Ok(());
        }
        let header = self.read_object_header(id)?;
        let obj = self.obj_mut(id)?;
        obj.lazy_loaded = false;
        if let Some(header) = header {
            obj.attrs = header.attrs;
            obj.set_name(&header.name);
            if let ObjectKind::Symlink(alias) = &mut obj.kind {
                *alias = header.alias;
            }
        }
        Ok(())
    }

    /// write a new header for an object and drop the old one
    pub(crate) fn update_object_header(&mut self, id: ObjectId, update: HeaderUpdate) -> Result<()> {
        let obj = self.obj(id)?;
        if obj.fake && id != OBJECTID_ROOT && !update.force && update.xattr.is_none() {
            return Ok(());
        }
        self.check_garbage_collection(false);
        self.load_object_details(id)?;

        let prev_chunk = self.obj(id)?.hdr_chunk;
        let prev = match self.read_object_header(id) {
            Ok(prev) => prev,
            Err(e) => {
                warn!("old header of object {id} unreadable: {e}");
                None
            }
        };

        let obj = self.obj(id)?;
        let parent_id = obj.parent.unwrap_or(0);
        let name = match (update.name, &prev) {
            (Some(name), _) if !name.is_empty() => name.to_owned(),
            (_, Some(prev)) => prev.name.clone(),
            _ => obj.name.clone(),
        };
        let file_size = match obj.file() {
            Some(_) if parent_id == OBJECTID_DELETED || parent_id == OBJECTID_UNLINKED => 0,
            Some(file) => file.file_size,
            None => 0,
        };
        let mut xattrs = prev.map(|p| p.xattrs).unwrap_or_default();
        if let Some(modification) = update.xattr {
            apply_xattr_mod(&mut xattrs, modification)?;
        }
        let header = ObjectHeader {
            obj_type: obj.object_type(),
            parent_id,
            name,
            attrs: obj.attrs,
            file_size,
            equiv_id: obj.equiv_id(),
            alias: match &obj.kind {
                ObjectKind::Symlink(alias) => alias.clone(),
                _ => String::new(),
            },
            is_shrink: update.is_shrink,
            shadows: update.shadows,
            xattrs,
        };
        let bytes = header.encode(self.data_bytes_per_chunk as usize)?;
        let serial = obj.serial.wrapping_add(1) & 3;
        let tags = ExtendedTags {
            obj_id: id,
            chunk_id: 0,
            n_bytes: 0,
            serial_number: serial,
            extra: Some(header.tag_info()),
            ..ExtendedTags::default()
        };

        let new_chunk = self.write_new_chunk_with_tags(&bytes, &tags, prev_chunk > 0)?;
        let has_dirty_data = self.cache.has_dirty(id);
        let obj = self.obj_mut(id)?;
        obj.hdr_chunk = new_chunk;
        obj.serial = serial;
        obj.valid = true;
        if !has_dirty_data {
            obj.dirty = false;
        }
        trace!("header of object {id} now in chunk {new_chunk}");
        if prev_chunk > 0 {
            self.delete_chunk(prev_chunk);
        }
        if update.is_shrink {
            let (block, _) = self.split_chunk(new_chunk);
            self.block_info_mut(block).has_shrink_header = true;
        }
        Ok(())
    }

    /// rename and move an object, writing its header
    /// # Params
    /// - `force`: replace an existing entry of the same name
    /// - `shadows`: id of the object this rename replaces, 0 for none
    pub(crate) fn change_name(
        &mut self,
        id: ObjectId,
        new_dir: ObjectId,
        name: &str,
        force: bool,
        shadows: ObjectId,
    ) -> Result<()> {
        if !self.obj(new_dir)?.is_directory() {
            return Err(FlashError::NotDirectory);
        }
        let unlink_op = new_dir == OBJECTID_UNLINKED;
        let delete_op = new_dir == OBJECTID_DELETED;
        let existing = self.find_by_name(new_dir, name)?;
        if !(unlink_op || delete_op || force || shadows > 0 || existing.is_none()) {
            return Err(FlashError::Exists);
        }
        let obj = self.obj_mut(id)?;
        obj.set_name(name);
        obj.dirty = true;
        self.add_to_directory(new_dir, id)?;
        if unlink_op {
            self.obj_mut(id)?.unlinked = true;
        }
        self.update_object_header(
            id,
            HeaderUpdate {
                name: Some(name),
                is_shrink: delete_op,
                shadows,
                ..HeaderUpdate::default()
            },
        )
    }

    /// touch a directory after its entries changed
    pub(crate) fn update_parent(&mut self, dir_id: Option<ObjectId>) {
        let Some(dir_id) = dir_id else { return };
        let Some(dir) = self.objects.get_mut(dir_id) else {
            return;
        };
        let now = time_util::now();
        dir.dirty = true;
        dir.attrs.mtime = now;
        dir.attrs.ctime = now;
        if self.config.defer_dir_update {
            if !self.dirty_dirs.contains(&dir_id) {
                self.dirty_dirs.push_back(dir_id);
            }
        } else if let Err(e) = self.update_object_header(dir_id, HeaderUpdate::default()) {
            warn!("updating directory {dir_id} failed: {e}");
        }
    }

    /// write the headers of directories whose update was deferred
    pub(crate) fn update_dirty_directories(&mut self) -> Result<()> {
        while let Some(dir_id) = self.dirty_dirs.pop_front() {
            if self.objects.get(dir_id).is_some_and(|d| d.dirty) {
                debug!("writing deferred header of directory {dir_id}");
                self.update_object_header(dir_id, HeaderUpdate::default())?;
            }
        }
        Ok(())
    }

    /// last step of every deletion: record it, drop the header and the object
    pub(crate) fn do_generic_object_deletion(&mut self, id: ObjectId) -> Result<()> {
        self.cache.invalidate_object(id);
        if self.obj(id)?.parent != Some(OBJECTID_DELETED) {
            if let Err(e) = self.change_name(id, OBJECTID_DELETED, "deleted", false, 0) {
                warn!("recording deletion of object {id} failed: {e}");
            }
        }
        self.remove_from_directory(id);
        let hdr_chunk = self.obj(id)?.hdr_chunk;
        self.delete_chunk(hdr_chunk);
        self.obj_mut(id)?.hdr_chunk = 0;
        self.free_object(id);
        debug!("object {id} deleted");
        Ok(())
    }

    /// move the data chunks of a deleted file to their blocks' soft deletion counts
    pub(crate) fn soft_delete_file(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.obj(id)?;
        if !obj.deleted || !obj.is_file() || obj.soft_deleted {
            return Ok(());
        }
        if obj.n_data_chunks == 0 {
            if let Some(file) = self.obj_mut(id)?.file_mut() {
                file.tree.clear();
            }
            return self.do_generic_object_deletion(id);
        }
        let entries = self
            .obj(id)?
            .file()
            .map(|f| f.tree.entries())
            .unwrap_or_default();
        for (_, entry) in entries {
            let chunk = entry << self.chunk_group_bits;
            let (block, _) = self.split_chunk(chunk);
            if self.is_valid_block(block) {
                self.block_info_mut(block).soft_deletions += 1;
                self.n_free_chunks += 1;
                if self.gc.oldest_dirty_seq != 0
                    && self.block_info(block).seq_number < self.gc.oldest_dirty_seq
                {
                    self.gc.oldest_dirty_seq = self.block_info(block).seq_number;
                    self.gc.oldest_dirty_block = Some(block);
                }
            }
        }
        let obj = self.obj_mut(id)?;
        if let Some(file) = obj.file_mut() {
            file.tree.clear();
        }
        obj.soft_deleted = true;
        Ok(())
    }

    fn unlink_file_if_needed(&mut self, id: ObjectId) -> Result<()> {
        if self.obj(id)?.open_handles == 0 {
            self.change_name(id, OBJECTID_DELETED, "deleted", false, 0)?;
            debug!("immediate deletion of file {id}");
            self.obj_mut(id)?.deleted = true;
            self.n_deleted_files += 1;
            self.resize(id, 0)?;
            self.soft_delete_file(id)
        } else {
            self.change_name(id, OBJECTID_UNLINKED, "unlinked", false, 0)
        }
    }

    fn delete_file(&mut self, id: ObjectId) -> Result<()> {
        self.resize(id, 0)?;
        if self.obj(id)?.n_data_chunks > 0 {
            if !self.obj(id)?.unlinked {
                self.unlink_file_if_needed(id)?;
            }
            let Some(obj) = self.objects.get(id) else {
                return Ok(());
            };
            let mut deleted = obj.deleted;
            if obj.unlinked && !obj.deleted {
                self.obj_mut(id)?.deleted = true;
                deleted = true;
                self.n_deleted_files += 1;
                self.soft_delete_file(id)?;
            }
            if deleted {
                Ok(())
            } else {
                Err(FlashError::NotPermitted)
            }
        } else {
            if let Some(file) = self.obj_mut(id)?.file_mut() {
                file.tree.clear();
            }
            self.do_generic_object_deletion(id)
        }
    }

    /// delete an object according to its type
    pub(crate) fn delete_object(&mut self, id: ObjectId) -> Result<()> {
        match self.obj(id)?.object_type() {
            ObjectType::File => self.delete_file(id),
            ObjectType::Directory => {
                self.dirty_dirs.retain(|&d| d != id);
                if self.is_non_empty_directory(id) {
                    return Err(FlashError::NotEmpty);
                }
                self.do_generic_object_deletion(id)
            }
            ObjectType::Hardlink => self.delete_hardlink(id),
            ObjectType::Symlink | ObjectType::Special => self.do_generic_object_deletion(id),
            ObjectType::Unknown => Ok(()),
        }
    }

    fn delete_hardlink(&mut self, id: ObjectId) -> Result<()> {
        let equiv_id = self.obj(id)?.equiv_id();
        if let Some(equiv) = self.objects.get_mut(equiv_id) {
            equiv.hard_links.retain(|&hl| hl != id);
        }
        self.do_generic_object_deletion(id)
    }

    pub(crate) fn is_non_empty_directory(&self, id: ObjectId) -> bool {
        self.objects
            .get(id)
            .and_then(|o| o.dir())
            .is_some_and(|d| !d.children.is_empty())
    }

    /// remove a name; the object lives on while handles or hardlinks refer to it
    pub(crate) fn unlink_worker(&mut self, id: ObjectId) -> Result<()> {
        let parent = self.obj(id)?.parent;
        self.update_parent(parent);

        let obj = self.obj(id)?;
        if obj.object_type() == ObjectType::Hardlink {
            return self.delete_hardlink(id);
        }
        if let Some(&hl) = obj.hard_links.first() {
            // the object takes over the name of one of its hardlinks,
            // which is then deleted in its place
            self.load_object_details(hl)?;
            let hl_obj = self.obj(hl)?;
            let name = hl_obj.name.clone();
            let hl_parent = hl_obj.parent.ok_or(FlashError::NotFound)?;
            self.obj_mut(id)?.hard_links.retain(|&h| h != hl);
            if let Some(hl_obj) = self.objects.get_mut(hl) {
                hl_obj.kind = ObjectKind::Hardlink { equiv_id: 0 };
            }
            self.add_to_directory(OBJECTID_UNLINKED, hl)?;
            self.change_name(id, hl_parent, &name, false, 0)?;
            return self.do_generic_object_deletion(hl);
        }
        if obj.open_handles == 0 {
            return match obj.object_type() {
                ObjectType::File => self.delete_file(id),
                ObjectType::Directory => {
                    self.dirty_dirs.retain(|&d| d != id);
                    if self.is_non_empty_directory(id) {
                        return Err(FlashError::NotEmpty);
                    }
                    self.do_generic_object_deletion(id)
                }
                ObjectType::Symlink | ObjectType::Special => self.do_generic_object_deletion(id),
                ObjectType::Hardlink | ObjectType::Unknown => Err(FlashError::NotPermitted),
            };
        }
        if self.is_non_empty_directory(id) {
            return Err(FlashError::NotEmpty);
        }
        self.change_name(id, OBJECTID_UNLINKED, "unlinked", false, 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::test_support::*;
    use crate::{OBJECTID_DELETED, OBJECTID_LOSTNFOUND, OBJECTID_ROOT, OBJECTID_UNLINKED};

    #[test]
    fn fake_directories_exist_after_mount() {
        let dev = small_device();
        for id in [OBJECTID_ROOT, OBJECTID_LOSTNFOUND, OBJECTID_UNLINKED, OBJECTID_DELETED] {
            let obj = dev.object(id).unwrap();
            assert!(obj.fake && obj.is_directory());
            assert!(!obj.rename_allowed && !obj.unlink_allowed);
        }
        let lost = dev.object(OBJECTID_LOSTNFOUND).unwrap();
        assert_eq!(lost.parent, Some(OBJECTID_ROOT));
        assert_eq!(lost.name, "lost+found");
    }

    #[test]
    fn unlinked_count_follows_objects_until_they_are_freed() {
        let mut dev = small_device();
        let kept = dev.create_file(OBJECTID_ROOT, "open", 0o644).unwrap();
        dev.write_file(kept, 0, &[9u8; 700]).unwrap();
        dev.flush(kept).unwrap();
        let handle = dev.open(kept).unwrap();
        dev.unlink(OBJECTID_ROOT, "open").unwrap();
        assert_eq!(dev.object(kept).unwrap().parent, Some(OBJECTID_UNLINKED));
        assert_eq!(dev.n_unlinked_files(), 1);

        let gone = dev.create_file(OBJECTID_ROOT, "gone", 0o644).unwrap();
        dev.unlink(OBJECTID_ROOT, "gone").unwrap();
        assert!(dev.object(gone).is_none());
        assert_eq!(dev.n_unlinked_files(), 1);

        dev.release(handle).unwrap();
        assert!(dev.object(kept).is_none());
        assert_eq!(dev.n_unlinked_files(), 0);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn header_rewrite_frees_the_old_chunk() {
        let mut dev = small_device();
        let id = dev.create_file(OBJECTID_ROOT, "h", 0o644).unwrap();
        let first = dev.object(id).unwrap().hdr_chunk;
        assert!(first > 0);
        dev.update_object_header(id, Default::default()).unwrap();
        let second = dev.object(id).unwrap().hdr_chunk;
        assert_ne!(first, second);
        assert!(!dev.chunk_in_use(first));
        assert_eq!(dev.object(id).unwrap().serial, 2);
        let header = dev.read_object_header(id).unwrap().unwrap();
        assert_eq!(header.name, "h");
        assert_eq!(header.parent_id, OBJECTID_ROOT);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn deleting_an_empty_file_drops_its_header() {
        let mut dev = small_device();
        let id = dev.create_file(OBJECTID_ROOT, "gone", 0o644).unwrap();
        dev.delete_object(id).unwrap();
        assert!(dev.object(id).is_none());
        assert!(matches!(
            dev.lookup(OBJECTID_ROOT, "gone"),
            Err(crate::FlashError::NotFound)
        ));
        dev.check_invariants().unwrap();
    }
}
