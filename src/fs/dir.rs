//! the operations a VFS binding calls: namespace, data, attributes and handles
use log::{debug, info};

use crate::error::{FlashError, Result};
use crate::nand::{NandDriver, ObjectType};
use crate::utils::time_util;

use super::device::Device;
use super::object::{Attributes, ObjectKind};
use super::objects::HeaderUpdate;
use super::xattr::{parse_xattr_namespace, XattrFlags, XattrMod};
use super::{ObjectId, MAX_ALIAS_LENGTH, MAX_NAME_LENGTH, OBJECTID_LOSTNFOUND};

/// Proof that an object is open.
///
/// An object unlinked while open keeps its data until the last handle is
/// given back to [Device::release].
#[must_use = "an open handle must be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct ObjectHandle {
    id: ObjectId,
}

impl ObjectHandle {
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

/// one entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: ObjectId,
    pub name: String,
    pub obj_type: ObjectType,
}

/// what kind of object [Device::mknod_object] makes
enum NewKind<'a> {
    File,
    Directory,
    Symlink(&'a str),
    Hardlink(ObjectId),
    Special,
}

impl<N: NandDriver> Device<N> {
    fn mknod_object(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        rdev: u32,
        kind: NewKind,
    ) -> Result<ObjectId> {
        if name.is_empty() {
            return Err(FlashError::NotFound);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(FlashError::NameTooLong);
        }
        if let NewKind::Symlink(alias) = kind {
            if alias.len() > MAX_ALIAS_LENGTH {
                return Err(FlashError::NameTooLong);
            }
        }
        if !self.obj(parent)?.is_directory() {
            return Err(FlashError::NotDirectory);
        }
        if self.find_by_name(parent, name)?.is_some() {
            return Err(FlashError::Exists);
        }

        let obj_type = match kind {
            NewKind::File => ObjectType::File,
            NewKind::Directory => ObjectType::Directory,
            NewKind::Symlink(_) => ObjectType::Symlink,
            NewKind::Hardlink(_) => ObjectType::Hardlink,
            NewKind::Special => ObjectType::Special,
        };
        let id = self.create_new_object(None, obj_type)?;
        let (uid, gid) = self.default_owner;
        let obj = self.obj_mut(id)?;
        obj.valid = true;
        obj.attrs = Attributes {
            rdev,
            ..Attributes::new(mode, uid, gid)
        };
        obj.set_name(name);
        obj.dirty = true;
        match kind {
            NewKind::Symlink(alias) => obj.kind = ObjectKind::Symlink(alias.to_owned()),
            NewKind::Hardlink(equiv_id) => obj.kind = ObjectKind::Hardlink { equiv_id },
            _ => {}
        }
        self.add_to_directory(parent, id)?;
        if let NewKind::Hardlink(equiv_id) = kind {
            self.obj_mut(equiv_id)?.hard_links.push(id);
        }

        let header_written = if self.free_space() == 0 {
            Err(FlashError::OutOfSpace)
        } else {
            self.update_object_header(
                id,
                HeaderUpdate {
                    name: Some(name),
                    ..HeaderUpdate::default()
                },
            )
        };
        if let Err(e) = header_written {
            debug!("creating {name} failed: {e}");
            self.remove_from_directory(id);
            self.free_object(id);
            return Err(e);
        }
        self.update_parent(Some(parent));
        Ok(id)
    }

    /// create a regular file
    pub fn create_file(&mut self, parent: ObjectId, name: &str, mode: u32) -> Result<ObjectId> {
        self.mknod_object(parent, name, libc::S_IFREG | (mode & 0o7777), 0, NewKind::File)
    }

    pub fn mkdir(&mut self, parent: ObjectId, name: &str, mode: u32) -> Result<ObjectId> {
        self.mknod_object(parent, name, libc::S_IFDIR | (mode & 0o7777), 0, NewKind::Directory)
    }

    /// create a symlink pointing at `alias`
    pub fn symlink(&mut self, parent: ObjectId, name: &str, mode: u32, alias: &str) -> Result<ObjectId> {
        self.mknod_object(
            parent,
            name,
            libc::S_IFLNK | (mode & 0o7777),
            0,
            NewKind::Symlink(alias),
        )
    }

    /// create a device node, fifo or socket
    /// # Params
    /// - `mode`: type bits and permissions
    /// - `rdev`: device number for device nodes
    pub fn mknod(&mut self, parent: ObjectId, name: &str, mode: u32, rdev: u32) -> Result<ObjectId> {
        self.mknod_object(parent, name, mode, rdev, NewKind::Special)
    }

    /// hardlink `name` in `parent` to `target`
    /// # Return
    /// the object the link refers to, which is `target` unless that is a hardlink itself
    pub fn link(&mut self, parent: ObjectId, name: &str, target: ObjectId) -> Result<ObjectId> {
        let equiv_id = self.equivalent(target);
        let target_obj = self.obj(equiv_id)?;
        if target_obj.is_directory() || target_obj.fake {
            return Err(FlashError::NotPermitted);
        }
        let mode = target_obj.attrs.mode;
        self.mknod_object(parent, name, mode, 0, NewKind::Hardlink(equiv_id))?;
        Ok(equiv_id)
    }

    /// object called `name` in directory `dir`
    pub fn lookup(&mut self, dir: ObjectId, name: &str) -> Result<ObjectId> {
        let dir = self.equivalent(dir);
        self.find_by_name(dir, name)?.ok_or(FlashError::NotFound)
    }

    /// remove `name` from `dir`
    pub fn unlink(&mut self, dir: ObjectId, name: &str) -> Result<()> {
        let id = self.lookup(dir, name)?;
        if !self.obj(id)?.unlink_allowed {
            return Err(FlashError::NotPermitted);
        }
        debug!("unlinking {name} ({id}) from {dir}");
        self.unlink_worker(id)
    }

    /// remove an empty directory; same as [Device::unlink] but only for directories
    pub fn rmdir(&mut self, dir: ObjectId, name: &str) -> Result<()> {
        let id = self.lookup(dir, name)?;
        if !self.obj(id)?.is_directory() {
            return Err(FlashError::NotDirectory);
        }
        self.unlink(dir, name)
    }

    fn is_ancestor(&self, ancestor: ObjectId, mut id: ObjectId) -> bool {
        for _ in 0..super::scan::MAX_PARENT_DEPTH {
            if id == ancestor {
                return true;
            }
            match self.objects.get(id).and_then(|o| o.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
        false
    }

    /// move `old_name` in `old_dir` to `new_name` in `new_dir`, replacing what is there
    pub fn rename(
        &mut self,
        old_dir: ObjectId,
        old_name: &str,
        new_dir: ObjectId,
        new_name: &str,
    ) -> Result<()> {
        if new_name.len() > MAX_NAME_LENGTH {
            return Err(FlashError::NameTooLong);
        }
        if new_name.is_empty() {
            return Err(FlashError::NotFound);
        }
        let id = self.lookup(old_dir, old_name)?;
        if !self.obj(id)?.rename_allowed {
            return Err(FlashError::NotPermitted);
        }
        if !self.obj(new_dir)?.is_directory() {
            return Err(FlashError::NotDirectory);
        }
        if self.obj(id)?.is_directory() && self.is_ancestor(id, new_dir) {
            return Err(FlashError::NotPermitted);
        }

        let target = self.find_by_name(new_dir, new_name)?;
        if let Some(target) = target.filter(|&t| t != id) {
            if self.is_non_empty_directory(target) {
                return Err(FlashError::NotEmpty);
            }
            // the new header names the target it shadows, so a scan that
            // sees it before the target's deletion still drops the target
            self.gc.disable = true;
            let shadowed = self.change_name(id, new_dir, new_name, true, target);
            if shadowed.is_ok() {
                if let Some(t) = self.objects.get_mut(target) {
                    t.is_shadowed = true;
                }
                if self.obj(target)?.unlink_allowed {
                    if let Err(e) = self.unlink_worker(target) {
                        debug!("unlinking rename target {target} failed: {e}");
                    }
                }
            }
            self.gc.disable = false;
            shadowed?;
        }

        let result = self.change_name(id, new_dir, new_name, true, 0);
        self.update_parent(Some(old_dir));
        if new_dir != old_dir {
            self.update_parent(Some(new_dir));
        }
        result
    }

    /// open an object for reading or writing
    pub fn open(&mut self, id: ObjectId) -> Result<ObjectHandle> {
        let obj = self.obj_mut(id)?;
        obj.open_handles += 1;
        Ok(ObjectHandle { id })
    }

    /// give a handle back; the last handle of an unlinked object deletes it
    pub fn release(&mut self, handle: ObjectHandle) -> Result<()> {
        let id = handle.id;
        let Some(obj) = self.objects.get_mut(id) else {
            return Err(FlashError::NotFound);
        };
        obj.open_handles = obj.open_handles.saturating_sub(1);
        if obj.open_handles > 0 {
            return Ok(());
        }
        if obj.unlinked {
            info!("last handle of unlinked object {id} released, deleting it");
            self.delete_object(id)
        } else {
            self.flush_object(id, false, false)
        }
    }

    /// read from a file
    /// # Return
    /// bytes read, fewer than `buf.len()` at the end of the file
    pub fn read_file(&mut self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let id = self.equivalent(id);
        self.read_data(id, offset, buf)
    }

    /// write to a file through the cache
    pub fn write_file(&mut self, id: ObjectId, offset: u64, data: &[u8]) -> Result<usize> {
        self.write(id, offset, data, false)
    }

    /// write to a file
    /// # Params
    /// - `write_through`: don't leave partial chunks dirty in the cache
    /// # Return
    /// bytes written, fewer than `data.len()` when the device filled up
    pub fn write(&mut self, id: ObjectId, offset: u64, data: &[u8], write_through: bool) -> Result<usize> {
        let id = self.equivalent(id);
        if !self.obj(id)?.is_file() {
            return Err(FlashError::NotFile);
        }
        if data.is_empty() {
            return Ok(0);
        }
        self.write_data(id, offset, data, write_through)
    }

    /// flush data and header of a file, touching its times
    pub fn flush(&mut self, id: ObjectId) -> Result<()> {
        self.flush_object(id, true, false)
    }

    pub fn file_size(&self, id: ObjectId) -> Result<u64> {
        let obj = self.obj(self.equivalent(id))?;
        obj.file().map(|f| f.file_size).ok_or(FlashError::NotFile)
    }

    pub fn object_type(&self, id: ObjectId) -> Result<ObjectType> {
        Ok(self.obj(id)?.object_type())
    }

    /// name of an object, `objNNN` for objects that never got a header
    pub fn object_name(&mut self, id: ObjectId) -> Result<String> {
        self.load_object_details(id)?;
        let obj = self.obj(id)?;
        if !obj.name.is_empty() {
            Ok(obj.name.clone())
        } else if id == OBJECTID_LOSTNFOUND {
            Ok(super::LOSTNFOUND_NAME.into())
        } else {
            Ok(format!("obj{id}"))
        }
    }

    /// entries of a directory, in id order
    pub fn read_dir(&mut self, dir: ObjectId) -> Result<Vec<DirEntry>> {
        let children: Vec<ObjectId> = self
            .obj(dir)?
            .dir()
            .ok_or(FlashError::NotDirectory)?
            .children
            .iter()
            .copied()
            .collect();
        children
            .into_iter()
            .map(|id| {
                Ok(DirEntry {
                    id,
                    name: self.object_name(id)?,
                    obj_type: self.obj(id)?.object_type(),
                })
            })
            .collect()
    }

    pub fn read_link(&mut self, id: ObjectId) -> Result<String> {
        self.load_object_details(id)?;
        match &self.obj(id)?.kind {
            ObjectKind::Symlink(alias) => Ok(alias.clone()),
            _ => Err(FlashError::Unsupported),
        }
    }

    /// attributes of an object, with the size of files
    pub fn attributes(&mut self, id: ObjectId) -> Result<Attributes> {
        let id = self.equivalent(id);
        self.load_object_details(id)?;
        Ok(self.obj(id)?.attrs)
    }

    /// replace the attributes of an object and write its header
    pub fn set_attributes(&mut self, id: ObjectId, attrs: Attributes) -> Result<()> {
        let id = self.equivalent(id);
        self.load_object_details(id)?;
        let obj = self.obj_mut(id)?;
        // the type bits can't change
        let type_bits = obj.attrs.mode & libc::S_IFMT;
        obj.attrs = Attributes {
            mode: type_bits | (attrs.mode & !libc::S_IFMT),
            ctime: time_util::now(),
            ..attrs
        };
        obj.dirty = true;
        self.update_object_header(id, HeaderUpdate::default())
    }

    pub fn set_xattr(&mut self, id: ObjectId, name: &str, value: &[u8], flags: XattrFlags) -> Result<()> {
        parse_xattr_namespace(name.as_bytes())?;
        let id = self.equivalent(id);
        let modification = XattrMod::Set {
            name: name.to_owned(),
            value: value.to_vec(),
            flags,
        };
        self.update_object_header(
            id,
            HeaderUpdate {
                xattr: Some(&modification),
                ..HeaderUpdate::default()
            },
        )
    }

    pub fn get_xattr(&mut self, id: ObjectId, name: &str) -> Result<Vec<u8>> {
        let id = self.equivalent(id);
        let header = self.read_object_header(id)?.ok_or(FlashError::NoData)?;
        header
            .xattrs
            .into_iter()
            .find(|x| x.name == name)
            .map(|x| x.value)
            .ok_or(FlashError::NoData)
    }

    pub fn list_xattr(&mut self, id: ObjectId) -> Result<Vec<String>> {
        let id = self.equivalent(id);
        Ok(self
            .read_object_header(id)?
            .map(|h| h.xattrs.into_iter().map(|x| x.name).collect())
            .unwrap_or_default())
    }

    pub fn remove_xattr(&mut self, id: ObjectId, name: &str) -> Result<()> {
        let id = self.equivalent(id);
        let modification = XattrMod::Remove { name: name.to_owned() };
        self.update_object_header(
            id,
            HeaderUpdate {
                xattr: Some(&modification),
                ..HeaderUpdate::default()
            },
        )
    }
}
