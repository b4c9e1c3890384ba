//! mapping from (file, chunk id) to physical chunks through the tnode tree
use log::{debug, warn};

use crate::error::{FlashError, Result};
use crate::nand::{compare_serials, ExtendedTags, NandDriver, SerialOrder};

use super::device::Device;
use super::ObjectId;

/// what to do when a chunk id is already mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    /// the caller deletes the previous chunk itself
    Replace,
    /// the copy seen later wins unless the serials say otherwise
    ForwardScan,
    /// blocks are seen newest first, so the mapped copy wins
    BackwardScan,
}

impl<N: NandDriver> Device<N> {
    /// tree entry for a physical chunk
    fn chunk_to_entry(&self, chunk: u32) -> u32 {
        chunk >> self.chunk_group_bits
    }

    /// find the chunk of a group that really holds `chunk_id` of `obj_id`
    fn find_chunk_in_group(
        &mut self,
        entry: u32,
        obj_id: ObjectId,
        chunk_id: u32,
    ) -> Result<Option<(u32, Option<ExtendedTags>)>> {
        if entry == 0 {
            return Ok(None);
        }
        let base = entry << self.chunk_group_bits;
        if self.chunk_group_size == 1 {
            return Ok(Some((base, None)));
        }
        // two live copies can share a group between a rewrite and the
        // deletion of the old copy, the newer serial wins
        let mut best: Option<(u32, ExtendedTags)> = None;
        for chunk in base..base + self.chunk_group_size {
            if !self.chunk_in_use(chunk) {
                continue;
            }
            let tags = self.read_chunk(chunk, None)?;
            if !(tags.chunk_used && tags.obj_id == obj_id && tags.chunk_id == chunk_id) {
                continue;
            }
            let newer = match &best {
                None => true,
                Some((_, held)) => match compare_serials(held.serial_number, tags.serial_number) {
                    SerialOrder::CandidateNewer => true,
                    SerialOrder::ExistingNewer => false,
                    SerialOrder::Ambiguous => tags.serial_number > held.serial_number,
                },
            };
            if newer {
                best = Some((chunk, tags));
            }
        }
        Ok(best.map(|(chunk, tags)| (chunk, Some(tags))))
    }

    fn tree_entry(&self, obj_id: ObjectId, chunk_id: u32) -> u32 {
        self.objects
            .get(obj_id)
            .and_then(|obj| obj.file())
            .map_or(0, |file| file.tree.get(chunk_id))
    }

    /// physical chunk holding data chunk `chunk_id` of a file
    pub fn find_chunk(&mut self, obj_id: ObjectId, chunk_id: u32) -> Option<u32> {
        let entry = self.tree_entry(obj_id, chunk_id);
        match self.find_chunk_in_group(entry, obj_id, chunk_id) {
            Ok(found) => found.map(|(chunk, _)| chunk),
            Err(e) => {
                warn!("looking up chunk {chunk_id} of object {obj_id} failed: {e}");
                None
            }
        }
    }

    /// like [Device::find_chunk], also returning the tags of the chunk
    pub(crate) fn find_chunk_with_tags(
        &mut self,
        obj_id: ObjectId,
        chunk_id: u32,
    ) -> Result<Option<(u32, ExtendedTags)>> {
        let entry = self.tree_entry(obj_id, chunk_id);
        match self.find_chunk_in_group(entry, obj_id, chunk_id)? {
            Some((chunk, Some(tags))) => Ok(Some((chunk, tags))),
            Some((chunk, None)) => {
                let tags = self.read_chunk(chunk, None)?;
                Ok(Some((chunk, tags)))
            }
            None => Ok(None),
        }
    }

    /// unmap `chunk_id` of a file and return the chunk it was in
    pub(crate) fn find_and_delete_chunk_in_file(
        &mut self,
        obj_id: ObjectId,
        chunk_id: u32,
    ) -> Option<u32> {
        let chunk = self.find_chunk(obj_id, chunk_id)?;
        if let Some(file) = self.objects.get_mut(obj_id).and_then(|obj| obj.file_mut()) {
            file.tree.clear_entry(chunk_id);
        }
        Some(chunk)
    }

    /// map data chunk `chunk_id` of a file to physical `chunk`
    /// # Params
    /// - `mode`: how an existing mapping for `chunk_id` is resolved
    pub(crate) fn put_chunk_in_file(
        &mut self,
        obj_id: ObjectId,
        chunk_id: u32,
        chunk: u32,
        mode: PutMode,
    ) -> Result<()> {
        let existing = match mode {
            PutMode::Replace => None,
            PutMode::ForwardScan | PutMode::BackwardScan => {
                self.find_chunk_with_tags(obj_id, chunk_id)?
            }
        };
        if let Some((existing_chunk, existing_tags)) = existing {
            let keep_new = match mode {
                PutMode::ForwardScan => {
                    let new_tags = self.read_chunk(chunk, None)?;
                    compare_serials(existing_tags.serial_number, new_tags.serial_number)
                        != SerialOrder::ExistingNewer
                }
                _ => false,
            };
            if !keep_new {
                debug!("dropping duplicate of chunk {chunk_id} of object {obj_id} at {chunk}");
                self.delete_chunk(chunk);
                return Ok(());
            }
            debug!(
                "chunk {chunk_id} of object {obj_id} at {chunk} replaces {existing_chunk}"
            );
            self.delete_chunk(existing_chunk);
        }

        let entry = self.chunk_to_entry(chunk);
        let obj = self.objects.get_mut(obj_id).ok_or(FlashError::NotFound)?;
        let file = obj.file_mut().ok_or(FlashError::NotFile)?;
        let previous = file.tree.set(chunk_id, entry).ok_or(FlashError::ScanAllocation)?;
        if previous == 0 {
            obj.n_data_chunks += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PutMode;
    use crate::fs::test_support::*;
    use crate::nand::ExtendedTags;

    #[test]
    fn mapped_chunks_are_found_again() {
        let mut dev = small_device();
        let file = dev.create_file(crate::OBJECTID_ROOT, "f", 0o644).unwrap();
        let tags = ExtendedTags {
            obj_id: file,
            chunk_id: 7,
            n_bytes: 1,
            ..ExtendedTags::default()
        };
        let chunk = dev.write_new_chunk_with_tags(b"x", &tags, false).unwrap();
        dev.put_chunk_in_file(file, 7, chunk, PutMode::Replace).unwrap();
        assert_eq!(dev.find_chunk(file, 7), Some(chunk));
        assert_eq!(dev.find_chunk(file, 6), None);
        assert_eq!(dev.object(file).unwrap().n_data_chunks, 1);

        assert_eq!(dev.find_and_delete_chunk_in_file(file, 7), Some(chunk));
        assert_eq!(dev.find_chunk(file, 7), None);
    }

    #[test]
    fn chunk_groups_resolve_by_tags() {
        let mut dev = grouped_device();
        assert!(dev.chunk_group_size > 1);
        let file = dev.create_file(crate::OBJECTID_ROOT, "g", 0o644).unwrap();
        let mut chunks = Vec::new();
        for chunk_id in 1..=3 {
            let tags = ExtendedTags {
                obj_id: file,
                chunk_id,
                n_bytes: 1,
                ..ExtendedTags::default()
            };
            let chunk = dev.write_new_chunk_with_tags(b"y", &tags, false).unwrap();
            dev.put_chunk_in_file(file, chunk_id, chunk, PutMode::Replace).unwrap();
            chunks.push(chunk);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(dev.find_chunk(file, i as u32 + 1), Some(*chunk));
        }
    }

    /// write chunk 1 of `file` with `serial`, at a chunk that isn't last in its group
    fn write_group_head(dev: &mut MemDevice, file: u32, serial: u8) -> u32 {
        let mask = dev.chunk_group_size - 1;
        loop {
            let chunk = write_serial(dev, file, serial);
            if chunk & mask != mask {
                return chunk;
            }
            dev.delete_chunk(chunk);
        }
    }

    fn write_serial(dev: &mut MemDevice, file: u32, serial: u8) -> u32 {
        let tags = ExtendedTags {
            obj_id: file,
            chunk_id: 1,
            n_bytes: 1,
            serial_number: serial,
            ..ExtendedTags::default()
        };
        dev.write_new_chunk_with_tags(&[serial], &tags, false).unwrap()
    }

    #[test]
    fn newest_serial_wins_inside_a_group() {
        // (first serial, second serial, which copy find_chunk must return)
        for (first, second, want_second) in [(1, 2, true), (3, 0, true), (0, 3, false), (3, 1, false)] {
            let mut dev = grouped_device();
            let file = dev.create_file(crate::OBJECTID_ROOT, "g", 0o644).unwrap();
            let a = write_group_head(&mut dev, file, first);
            dev.put_chunk_in_file(file, 1, a, PutMode::Replace).unwrap();
            let b = write_serial(&mut dev, file, second);
            assert_eq!(a >> dev.chunk_group_bits, b >> dev.chunk_group_bits);

            let want = if want_second { b } else { a };
            assert_eq!(dev.find_chunk(file, 1), Some(want), "serials {first} then {second}");
        }
    }
}
