//! file data: reads, writes, holes, truncation and flushing
use log::{debug, trace, warn};

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver};
use crate::utils::time_util;

use super::chunk_map::PutMode;
use super::device::Device;
use super::objects::HeaderUpdate;
use super::{ObjectId, MAX_CHUNK_ID, OBJECTID_DELETED, OBJECTID_UNLINKED, SMALL_HOLE_THRESHOLD};

/// a chunk id computed in 64 bits, saturated so range checks still catch it
fn chunk_id_of(id: u64) -> u32 {
    u32::try_from(id).unwrap_or(u32::MAX)
}

impl<N: NandDriver> Device<N> {
    /// `(chunk id, offset in chunk)` of a byte position, chunk ids start at 1.
    /// positions past the last addressable chunk map to `u32::MAX`
    fn addr_to_chunk(&self, addr: u64) -> (u32, usize) {
        let cb = self.data_bytes_per_chunk as u64;
        (chunk_id_of(addr / cb + 1), (addr % cb) as usize)
    }

    /// the largest file size the chunk ids can address
    pub fn max_file_size(&self) -> u64 {
        MAX_CHUNK_ID as u64 * self.data_bytes_per_chunk as u64
    }

    /// refuse a file extent ending past [Device::max_file_size]
    fn check_file_extent(&self, offset: u64, len: u64) -> Result<u64> {
        offset
            .checked_add(len)
            .filter(|&end| end <= self.max_file_size())
            .ok_or(FlashError::FileTooBig)
    }

    fn parent_is_unlinked_or_deleted(&self, id: ObjectId) -> bool {
        matches!(
            self.objects.get(id).and_then(|o| o.parent),
            Some(OBJECTID_UNLINKED) | Some(OBJECTID_DELETED)
        )
    }

    /// read one data chunk of a file into `buffer`, zeros if it isn't there
    pub(crate) fn read_chunk_data(&mut self, id: ObjectId, chunk_id: u32, buffer: &mut [u8]) -> Result<()> {
        match self.find_chunk(id, chunk_id) {
            Some(chunk) => {
                let tags = self.read_chunk(chunk, Some(buffer))?;
                if tags.ecc_failed() {
                    warn!("chunk {chunk_id} of object {id} lost to an ECC error");
                    buffer.fill(0);
                }
            }
            None => buffer.fill(0),
        }
        Ok(())
    }

    /// write one data chunk of a file and retire the copy it replaces
    /// # Params
    /// - `data`: the valid bytes of the chunk
    /// - `use_reserve`: allowed to take chunks held back for garbage collection
    /// # Return
    /// the physical chunk written
    pub(crate) fn write_chunk_data_to_object(
        &mut self,
        id: ObjectId,
        chunk_id: u32,
        data: &[u8],
        use_reserve: bool,
    ) -> Result<u32> {
        if chunk_id == 0 || chunk_id > MAX_CHUNK_ID {
            return Err(FlashError::OutOfSpace);
        }
        self.check_garbage_collection(false);

        let prev = self.find_chunk_with_tags(id, chunk_id)?;
        if prev.is_none() {
            // make the tree nodes now, a failure later is harder to undo
            let file = self.obj_mut(id)?.file_mut().ok_or(FlashError::NotFile)?;
            file.tree.set(chunk_id, 0).ok_or(FlashError::OutOfSpace)?;
        }
        let tags = ExtendedTags {
            obj_id: id,
            chunk_id,
            n_bytes: data.len() as u32,
            serial_number: prev.map_or(1, |(_, t)| t.serial_number.wrapping_add(1) & 3),
            ..ExtendedTags::default()
        };
        let new_chunk = self.write_new_chunk_with_tags(data, &tags, use_reserve)?;
        self.put_chunk_in_file(id, chunk_id, new_chunk, PutMode::Replace)?;
        if let Some((prev_chunk, _)) = prev {
            self.delete_chunk(prev_chunk);
        }
        trace!("chunk {chunk_id} of object {id} written to {new_chunk}");
        Ok(new_chunk)
    }

    /// read file data at `offset`, up to the end of the file
    /// # Return
    /// the number of bytes read
    pub(crate) fn read_data(&mut self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file_size = self.obj(id)?.file().ok_or(FlashError::NotFile)?.file_size;
        if offset >= file_size {
            return Ok(0);
        }
        let n = buf.len().min((file_size - offset) as usize);
        let cb = self.data_bytes_per_chunk as usize;
        let mut done = 0;
        while done < n {
            let (chunk_id, start) = self.addr_to_chunk(offset + done as u64);
            let n_copy = (cb - start).min(n - done);
            let out = &mut buf[done..done + n_copy];
            let cached = self.find_chunk_cache(id, chunk_id);

            if cached.is_some() || n_copy != cb {
                let index = match cached {
                    Some(index) => Some(index),
                    None => match self.grab_chunk_cache()? {
                        Some(index) => {
                            let mut data = std::mem::take(&mut self.cache.entry_mut(index).data);
                            let loaded = self.read_chunk_data(id, chunk_id, &mut data);
                            let entry = self.cache.entry_mut(index);
                            entry.data = data;
                            entry.obj_id = id;
                            entry.chunk_id = chunk_id;
                            entry.dirty = false;
                            entry.n_bytes = 0;
                            if let Err(e) = loaded {
                                self.cache.free_entry(index);
                                return Err(e);
                            }
                            Some(index)
                        }
                        None => None,
                    },
                };
                match index {
                    Some(index) => {
                        self.cache.mark_use(index, false);
                        out.copy_from_slice(&self.cache.entry(index).data[start..start + n_copy]);
                    }
                    None => {
                        let mut local = self.new_chunk_buffer();
                        self.read_chunk_data(id, chunk_id, &mut local)?;
                        out.copy_from_slice(&local[start..start + n_copy]);
                    }
                }
            } else {
                self.read_chunk_data(id, chunk_id, out)?;
            }
            done += n_copy;
        }
        Ok(done)
    }

    /// write file data at `offset`, through the cache for partial chunks
    /// # Params
    /// - `write_through`: write cached chunks to flash straight away
    /// # Return
    /// the number of bytes written, short when space ran out
    fn do_write(&mut self, id: ObjectId, offset: u64, data: &[u8], write_through: bool) -> Result<usize> {
        let cb = self.data_bytes_per_chunk as usize;
        let mut done = 0;
        let mut failure = None;
        while done < data.len() {
            let (chunk_id, start) = self.addr_to_chunk(offset + done as u64);
            let n_copy = (cb - start).min(data.len() - done);
            let src = &data[done..done + n_copy];
            let chunk_start = (chunk_id as u64 - 1) * cb as u64;
            let file_size = self.obj(id)?.file_size();

            let written = if n_copy != cb || !self.config.cache_bypass_aligned {
                // bytes of the chunk that stay valid after this write
                let n_bytes_read = if chunk_start > file_size {
                    0
                } else {
                    (file_size - chunk_start).min(cb as u64) as usize
                };
                let n_write_back = n_bytes_read.max(start + n_copy);
                if self.cache.is_enabled() {
                    self.write_through_cache(id, chunk_id, start, src, n_write_back, write_through)
                } else {
                    let mut local = self.new_chunk_buffer();
                    self.read_chunk_data(id, chunk_id, &mut local)?;
                    local[start..start + n_copy].copy_from_slice(src);
                    self.write_chunk_data_to_object(id, chunk_id, &local[..n_write_back], false)
                        .map(|_| ())
                }
            } else {
                let written = self.write_chunk_data_to_object(id, chunk_id, src, false);
                self.cache.invalidate_chunk(id, chunk_id);
                written.map(|_| ())
            };
            match written {
                Ok(()) => done += n_copy,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let obj = self.obj_mut(id)?;
        if let Some(file) = obj.file_mut() {
            file.file_size = file.file_size.max(offset + done as u64);
        }
        obj.dirty = true;
        match failure {
            Some(e) if done == 0 => Err(e),
            Some(e) => {
                debug!("short write to object {id}: {done} of {} bytes: {e}", data.len());
                Ok(done)
            }
            None => Ok(done),
        }
    }

    fn write_through_cache(
        &mut self,
        id: ObjectId,
        chunk_id: u32,
        start: usize,
        src: &[u8],
        n_write_back: usize,
        write_through: bool,
    ) -> Result<()> {
        let mut index = self.find_chunk_cache(id, chunk_id);
        if index.is_none() && self.check_space_for_allocation(1) {
            index = self.grab_chunk_cache()?;
            if let Some(i) = index {
                let mut buffer = std::mem::take(&mut self.cache.entry_mut(i).data);
                let loaded = self.read_chunk_data(id, chunk_id, &mut buffer);
                let entry = self.cache.entry_mut(i);
                entry.data = buffer;
                entry.obj_id = id;
                entry.chunk_id = chunk_id;
                entry.dirty = false;
                if let Err(e) = loaded {
                    self.cache.free_entry(i);
                    return Err(e);
                }
            }
        } else if let Some(i) = index {
            // a read cache entry can't turn dirty without space to flush it
            if !self.cache.entry(i).dirty && !self.check_space_for_allocation(1) {
                index = None;
            }
        }
        let i = index.ok_or(FlashError::OutOfSpace)?;
        self.cache.mark_use(i, true);
        let entry = self.cache.entry_mut(i);
        entry.data[start..start + src.len()].copy_from_slice(src);
        entry.n_bytes = n_write_back as u32;
        if write_through {
            let data = entry.data[..n_write_back].to_vec();
            self.write_chunk_data_to_object(id, chunk_id, &data, true)?;
            if let Some(i) = self.cache.find(id, chunk_id) {
                self.cache.entry_mut(i).dirty = false;
            }
        }
        Ok(())
    }

    /// write file data, filling any hole between the end of file and `offset` first
    pub(crate) fn write_data(&mut self, id: ObjectId, offset: u64, data: &[u8], write_through: bool) -> Result<usize> {
        self.check_file_extent(offset, data.len() as u64)?;
        self.handle_hole(id, offset)?;
        self.do_write(id, offset, data, write_through)
    }

    /// grow a file to `new_size`: zeros for a small hole, a shrink header otherwise
    fn handle_hole(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        let old_size = self.obj(id)?.file().ok_or(FlashError::NotFile)?.file_size;
        if new_size <= old_size {
            return Ok(());
        }
        let increase = new_size - old_size;
        let cb = self.data_bytes_per_chunk as u64;
        let small_hole = increase < SMALL_HOLE_THRESHOLD * cb
            && self.check_space_for_allocation(SMALL_HOLE_THRESHOLD as u32 + 1);

        let mut small_ok = false;
        if small_hole {
            let zeros = vec![0u8; cb as usize];
            let mut pos = old_size;
            small_ok = true;
            while pos < new_size {
                let n = (new_size - pos).min(cb) as usize;
                match self.do_write(id, pos, &zeros[..n], false) {
                    Ok(written) if written == n => pos += n as u64,
                    _ => {
                        small_ok = false;
                        break;
                    }
                }
            }
            if !small_ok {
                warn!("zero filling a hole in object {id} failed, cutting back to {old_size}");
                self.resize_down(id, old_size)?;
            }
        }

        if !small_ok && !self.parent_is_unlinked_or_deleted(id) {
            // the old size in a shrink header stops a scan from
            // resurrecting stale chunks inside the hole
            self.update_object_header(
                id,
                HeaderUpdate {
                    is_shrink: true,
                    ..HeaderUpdate::default()
                },
            )?;
        }
        Ok(())
    }

    /// delete the data chunks that lie wholly past `new_size`, last first
    pub(crate) fn prune_resized_chunks(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        let old_size = self.obj(id)?.file_size();
        if old_size == 0 {
            return Ok(());
        }
        let cb = self.data_bytes_per_chunk as u64;
        // sizes restored from flash aren't bounded by the write path
        let last_del = chunk_id_of(1 + (old_size - 1) / cb).min(MAX_CHUNK_ID);
        let start_del = chunk_id_of(1 + new_size.div_ceil(cb));
        for chunk_id in (start_del..=last_del).rev() {
            if let Some(chunk) = self.find_and_delete_chunk_in_file(id, chunk_id) {
                if !self.is_valid_chunk(chunk) {
                    warn!("object {id} mapped chunk {chunk_id} to bad chunk {chunk}");
                    continue;
                }
                let obj = self.obj_mut(id)?;
                obj.n_data_chunks = obj.n_data_chunks.saturating_sub(1);
                self.delete_chunk(chunk);
            }
        }
        Ok(())
    }

    /// shrink a file, zero padding the new last chunk
    pub(crate) fn resize_down(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        self.prune_resized_chunks(id, new_size)?;
        let cb = self.data_bytes_per_chunk as u64;
        let new_full = new_size / cb;
        let partial = (new_size % cb) as usize;
        if partial != 0 {
            let last_chunk = chunk_id_of(new_full + 1);
            let mut buffer = self.new_chunk_buffer();
            self.read_chunk_data(id, last_chunk, &mut buffer)?;
            buffer[partial..].fill(0);
            self.write_chunk_data_to_object(id, last_chunk, &buffer[..partial], true)?;
        }
        let file = self.obj_mut(id)?.file_mut().ok_or(FlashError::NotFile)?;
        file.file_size = new_size;
        file.tree.prune();
        Ok(())
    }

    /// set the size of a file: growing leaves a hole, shrinking drops the chunks past the end
    pub fn resize(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        let id = self.equivalent(id);
        if !self.obj(id)?.is_file() {
            return Err(FlashError::NotFile);
        }
        self.check_file_extent(new_size, 0)?;
        self.flush_file_cache(id)?;
        self.cache.invalidate_object(id);
        self.check_garbage_collection(false);

        let old_size = self.obj(id)?.file().ok_or(FlashError::NotFile)?.file_size;
        if new_size == old_size {
            return Ok(());
        }
        debug!("resizing object {id} from {old_size} to {new_size}");
        if new_size > old_size {
            self.handle_hole(id, new_size)?;
            if let Some(file) = self.obj_mut(id)?.file_mut() {
                file.file_size = new_size;
            }
        } else {
            self.resize_down(id, new_size)?;
        }

        let obj = self.obj(id)?;
        if obj.parent.is_some() && !obj.is_shadowed && !self.parent_is_unlinked_or_deleted(id) {
            self.update_object_header(
                id,
                HeaderUpdate {
                    is_shrink: new_size < old_size,
                    ..HeaderUpdate::default()
                },
            )?;
        }
        Ok(())
    }

    /// write back cached data and, unless `data_only`, the header of a dirty object
    /// # Params
    /// - `update_time`: set mtime and ctime to now first
    /// - `data_only`: leave the header alone
    pub fn flush_object(&mut self, id: ObjectId, update_time: bool, data_only: bool) -> Result<()> {
        let id = self.equivalent(id);
        if !self.obj(id)?.dirty {
            return Ok(());
        }
        self.flush_file_cache(id)?;
        if data_only {
            return Ok(());
        }
        if update_time {
            let now = time_util::now();
            let attrs = &mut self.obj_mut(id)?.attrs;
            attrs.mtime = now;
            attrs.ctime = now;
        }
        self.update_object_header(id, HeaderUpdate::default())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FlashError;
    use crate::fs::test_support::*;
    use crate::fs::MAX_CHUNK_ID;
    use crate::OBJECTID_ROOT;

    #[test]
    fn partial_writes_merge_in_the_cache() {
        let mut dev = small_device();
        let f = dev.create_file(OBJECTID_ROOT, "p", 0o644).unwrap();
        assert_eq!(dev.write_file(f, 0, b"hello ").unwrap(), 6);
        assert_eq!(dev.write_file(f, 6, b"world").unwrap(), 5);
        // nothing reached flash yet
        assert_eq!(dev.find_chunk(f, 1), None);
        let mut buf = [0u8; 32];
        assert_eq!(dev.read_file(f, 0, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");

        dev.flush(f).unwrap();
        let chunk = dev.find_chunk(f, 1).unwrap();
        let tags = dev.read_chunk(chunk, None).unwrap();
        assert_eq!(tags.n_bytes, 11);
        assert_eq!(tags.serial_number, 1);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn uncached_device_reads_back_what_it_wrote() {
        let mut dev = device_with(|c| c.n_caches = 0);
        let cb = dev.data_bytes_per_chunk() as usize;
        let f = dev.create_file(OBJECTID_ROOT, "nc", 0o644).unwrap();
        let data: Vec<u8> = (0..cb * 2 + 17).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(dev.write_file(f, 3, &data).unwrap(), data.len());
        let mut buf = vec![0xaa; data.len() + 3];
        assert_eq!(dev.read_file(f, 0, &mut buf).unwrap(), data.len() + 3);
        assert_eq!(&buf[..3], &[0, 0, 0]);
        assert_eq!(&buf[3..], &data[..]);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn large_hole_writes_a_shrink_header() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as u64;
        let f = dev.create_file(OBJECTID_ROOT, "holey", 0o644).unwrap();
        dev.write_file(f, 0, b"head").unwrap();
        dev.flush(f).unwrap();
        let far = cb * 10;
        dev.write_file(f, far, b"tail").unwrap();
        let hdr_chunk = dev.object(f).unwrap().hdr_chunk;
        let (block, _) = dev.split_chunk(hdr_chunk);
        assert!(dev.block(block).unwrap().has_shrink_header);
        assert_eq!(dev.file_size(f).unwrap(), far + 4);
        // the hole reads as zeros and was never written
        assert_eq!(dev.find_chunk(f, 5), None);
        let mut buf = vec![0xffu8; 8];
        dev.read_file(f, cb * 5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        dev.check_invariants().unwrap();
    }

    #[test]
    fn small_hole_is_zero_filled() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as u64;
        let f = dev.create_file(OBJECTID_ROOT, "small", 0o644).unwrap();
        dev.write_file(f, 0, b"x").unwrap();
        dev.write_file(f, cb + 10, b"y").unwrap();
        dev.flush(f).unwrap();
        assert!(dev.find_chunk(f, 1).is_some());
        assert!(dev.find_chunk(f, 2).is_some());
        let mut buf = vec![0xffu8; cb as usize + 11];
        dev.read_file(f, 0, &mut buf).unwrap();
        assert_eq!(buf[0], b'x');
        assert!(buf[1..cb as usize + 10].iter().all(|&b| b == 0));
        assert_eq!(buf[cb as usize + 10], b'y');
    }

    #[test]
    fn writes_past_the_last_chunk_id_are_refused() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as u64;
        let f = dev.create_file(OBJECTID_ROOT, "far", 0o644).unwrap();
        dev.write_file(f, 0, b"hello").unwrap();
        dev.flush(f).unwrap();

        // 32 bit truncation of these chunk ids would land on chunk 1
        assert!(matches!(dev.write_file(f, cb << 32, b"X"), Err(FlashError::FileTooBig)));
        assert!(matches!(dev.write_file(f, u64::MAX - 1, b"XY"), Err(FlashError::FileTooBig)));
        assert!(matches!(
            dev.write_file(f, dev.max_file_size(), b"X"),
            Err(FlashError::FileTooBig)
        ));
        assert!(matches!(dev.resize(f, cb << 32), Err(FlashError::FileTooBig)));

        let mut buf = [0u8; 8];
        assert_eq!(dev.read_file(f, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(dev.file_size(f).unwrap(), 5);

        // the very last byte is still addressable
        let last = dev.max_file_size() - 1;
        assert_eq!(dev.write_file(f, last, b"Z").unwrap(), 1);
        dev.flush(f).unwrap();
        assert_eq!(dev.file_size(f).unwrap(), dev.max_file_size());
        assert!(dev.find_chunk(f, MAX_CHUNK_ID).is_some());
        assert_eq!(dev.read_file(f, last, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'Z');
        assert_eq!(dev.read_file(f, 0, &mut buf[..5]).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        dev.check_invariants().unwrap();
    }

    #[test]
    fn shrink_then_grow_reads_zeros_past_the_cut() {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as usize;
        let f = dev.create_file(OBJECTID_ROOT, "a", 0o644).unwrap();
        let data: Vec<u8> = (0..cb * 3 + 100).map(|i| (i % 250) as u8 + 1).collect();
        dev.write_file(f, 0, &data).unwrap();
        dev.flush(f).unwrap();
        let cut = cb * 3 / 2;
        dev.resize(f, cut as u64).unwrap();
        dev.resize(f, (cb * 3) as u64).unwrap();

        let check = |dev: &mut MemDevice| {
            assert_eq!(dev.file_size(f).unwrap(), (cb * 3) as u64);
            let mut buf = vec![0xffu8; cb * 4];
            assert_eq!(dev.read_file(f, 0, &mut buf).unwrap(), cb * 3);
            assert_eq!(&buf[..cut], &data[..cut]);
            assert!(buf[cut..cb * 3].iter().all(|&b| b == 0));
            assert_eq!(dev.find_chunk(f, 4), None);
            dev.check_invariants().unwrap();
        };
        check(&mut dev);
        dev.flush(f).unwrap();
        let mut dev = crash_and_scan(dev, crate::ScanMode::Backward);
        check(&mut dev);
        let mut dev = crash_and_scan(dev, crate::ScanMode::Forward);
        check(&mut dev);
    }
}
