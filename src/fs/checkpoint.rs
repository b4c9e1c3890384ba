//! checkpoints: a snapshot of the block table, the bitmap and every object
//! with its tnodes, so that a mount can skip the scan
//!
//! The stream is a sequence of bincode records:
//! head marker, device counters, block infos, bitmap, objects (each file
//! followed by its level-0 tnodes, `None` terminated), `None`, tail marker,
//! and a [blake3] hash of everything before it. A stream failing any check
//! is rejected as a whole before any of it is applied.
use bincode::config;
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{FlashError, Result};
use crate::nand::{NandDriver, ObjectType};

use super::block_info::BlockInfo;
use super::device::Device;
use super::object::{Object, ObjectKind};
use super::tnode::Level0;
use super::ObjectId;

const CHECKPOINT_MAGIC: u32 = 0x5941_FF53;
const CHECKPOINT_VERSION: u32 = 4;
/// extra blocks reserved on top of the computed checkpoint size, for bad blocks
const CHECKPOINT_SPARE_BLOCKS: u32 = 3;
const CHECKSUM_LEN: usize = blake3::OUT_LEN;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ValidityMarker {
    magic: u32,
    version: u32,
    head: bool,
}

impl ValidityMarker {
    fn new(head: bool) -> Self {
        ValidityMarker {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            head,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
struct DeviceRecord {
    n_blocks: u32,
    chunks_per_block: u32,
    n_erased_blocks: u32,
    alloc_block: Option<u32>,
    alloc_page: u32,
    n_free_chunks: i64,
    n_deleted_files: u32,
    n_unlinked_files: u32,
    n_bg_deletions: u32,
    seq_number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ObjectRecord {
    id: ObjectId,
    parent_id: ObjectId,
    hdr_chunk: u32,
    obj_type: ObjectType,
    deleted: bool,
    soft_deleted: bool,
    unlinked: bool,
    fake: bool,
    rename_allowed: bool,
    unlink_allowed: bool,
    serial: u8,
    n_data_chunks: u32,
    /// size of a file, equivalent object of a hardlink
    size_or_equiv: u64,
}

impl From<&Object> for ObjectRecord {
    fn from(obj: &Object) -> Self {
        let size_or_equiv = match &obj.kind {
            ObjectKind::File(file) => file.file_size,
            ObjectKind::Hardlink { equiv_id } => *equiv_id as u64,
            _ => 0,
        };
        ObjectRecord {
            id: obj.id,
            parent_id: obj.parent.unwrap_or(0),
            hdr_chunk: obj.hdr_chunk,
            obj_type: obj.object_type(),
            deleted: obj.deleted,
            soft_deleted: obj.soft_deleted,
            unlinked: obj.unlinked,
            fake: obj.fake,
            rename_allowed: obj.rename_allowed,
            unlink_allowed: obj.unlink_allowed,
            serial: obj.serial,
            n_data_chunks: obj.n_data_chunks,
            size_or_equiv,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
struct TnodeRecord {
    base_offset: u32,
    entries: Level0,
}

/// bincode length of a record
fn record_len<T: Serialize + Default>() -> usize {
    bincode::serde::encode_to_vec(T::default(), config::legacy()).map_or(0, |v| v.len())
}

#[derive(Default)]
struct RecordWriter {
    bytes: Vec<u8>,
}

impl RecordWriter {
    fn put<T: Serialize>(&mut self, record: &T) -> Result<()> {
        bincode::serde::encode_into_std_write(record, &mut self.bytes, config::legacy())?;
        Ok(())
    }

    /// the stream with its checksum appended
    fn finish(mut self) -> Vec<u8> {
        let sum = blake3::hash(&self.bytes);
        self.bytes.extend_from_slice(sum.as_bytes());
        self.bytes
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordReader<'a> {
    /// check and strip the checksum of `stream`
    fn new(stream: &'a [u8]) -> Result<Self> {
        if stream.len() < CHECKSUM_LEN {
            return Err(FlashError::CorruptCheckpoint(format!(
                "stream of {} bytes is too short",
                stream.len()
            )));
        }
        let (body, sum) = stream.split_at(stream.len() - CHECKSUM_LEN);
        if blake3::hash(body).as_bytes()[..] != *sum {
            return Err(FlashError::CorruptCheckpoint("checksum mismatch".into()));
        }
        Ok(RecordReader { bytes: body })
    }

    fn take<T: DeserializeOwned>(&mut self) -> Result<T> {
        let (record, n) = bincode::serde::decode_from_slice(self.bytes, config::legacy())?;
        self.bytes = &self.bytes[n..];
        Ok(record)
    }

    fn expect_marker(&mut self, head: bool) -> Result<()> {
        let marker: ValidityMarker = self.take()?;
        if marker != ValidityMarker::new(head) {
            return Err(FlashError::CorruptCheckpoint(format!(
                "bad validity marker {marker:?}"
            )));
        }
        Ok(())
    }
}

/// a decoded checkpoint, not yet applied
struct CheckpointImage {
    device: DeviceRecord,
    blocks: Vec<BlockInfo>,
    bitmap: Vec<u8>,
    objects: Vec<(ObjectRecord, Vec<TnodeRecord>)>,
}

impl<N: NandDriver> Device<N> {
    fn checkpoint_required(&self) -> bool {
        !self.config.skip_checkpoint_write && self.n_blocks() >= self.config.checkpoint_min_blocks
    }

    /// blocks still to be held back so that a checkpoint can be written
    pub(crate) fn checkpoint_blocks_required(&mut self) -> u32 {
        if !self.checkpoint_required() {
            return 0;
        }
        if self.ckpt.blocks_required == 0 {
            let n_blocks = self.n_blocks() as usize;
            let n_tnodes: usize = self
                .objects
                .values()
                .filter_map(|o| o.file())
                .map(|f| f.tree.n_tnodes() as usize)
                .sum();
            let n_bytes = 2 * record_len::<ValidityMarker>()
                + record_len::<DeviceRecord>()
                + n_blocks * record_len::<BlockInfo>()
                + 8
                + n_blocks * self.chunk_bits.stride()
                + self.objects.len() * (record_len::<ObjectRecord>() + 2)
                + n_tnodes * (record_len::<TnodeRecord>() + 1)
                + CHECKSUM_LEN;
            let block_bytes = self.data_bytes_per_chunk as usize * self.chunks_per_block as usize;
            self.ckpt.blocks_required = (n_bytes / block_bytes) as u32 + CHECKPOINT_SPARE_BLOCKS;
        }
        self.ckpt
            .blocks_required
            .saturating_sub(self.ckpt.blocks_in_checkpoint)
    }

    /// forget the checkpoint and erase its blocks
    pub(crate) fn invalidate_checkpoint(&mut self) {
        if self.ckpt.is_checkpointed || self.ckpt.blocks_in_checkpoint > 0 {
            debug!("invalidating checkpoint of {}", self.config.name);
            self.ckpt.is_checkpointed = false;
            self.erase_checkpoint_blocks();
        }
    }

    fn device_record(&self) -> DeviceRecord {
        DeviceRecord {
            n_blocks: self.n_blocks(),
            chunks_per_block: self.chunks_per_block,
            n_erased_blocks: self.n_erased_blocks,
            alloc_block: self.alloc_block,
            alloc_page: self.alloc_page,
            n_free_chunks: self.n_free_chunks,
            n_deleted_files: self.n_deleted_files,
            n_unlinked_files: self.n_unlinked_files,
            n_bg_deletions: self.n_bg_deletions,
            seq_number: self.seq_number,
        }
    }

    fn encode_checkpoint(&self) -> Result<Vec<u8>> {
        let mut writer = RecordWriter::default();
        writer.put(&ValidityMarker::new(true))?;
        writer.put(&self.device_record())?;
        for bi in &self.blocks {
            writer.put(bi)?;
        }
        let bitmap: Vec<u8> = (0..self.blocks.len())
            .flat_map(|i| self.chunk_bits.block_bytes(i))
            .collect();
        writer.put(&bitmap)?;

        let mut n_tnodes = 0;
        for id in self.objects.ids() {
            let obj = self.obj(id)?;
            writer.put(&Some(ObjectRecord::from(obj)))?;
            if let Some(file) = obj.file() {
                for (base_offset, entries) in file.tree.level0_nodes() {
                    writer.put(&Some(TnodeRecord {
                        base_offset,
                        entries,
                    }))?;
                    n_tnodes += 1;
                }
                writer.put(&None::<TnodeRecord>)?;
            }
        }
        writer.put(&None::<ObjectRecord>)?;
        writer.put(&ValidityMarker::new(false))?;
        debug!(
            "checkpoint of {} objects and {n_tnodes} tnodes",
            self.objects.len()
        );
        Ok(writer.finish())
    }

    fn decode_checkpoint(&self, stream: &[u8]) -> Result<CheckpointImage> {
        let mut reader = RecordReader::new(stream)?;
        reader.expect_marker(true)?;
        let device: DeviceRecord = reader.take()?;
        if device.n_blocks != self.n_blocks() || device.chunks_per_block != self.chunks_per_block {
            return Err(FlashError::CorruptCheckpoint(format!(
                "written for {} blocks of {} chunks",
                device.n_blocks, device.chunks_per_block
            )));
        }
        let blocks = (0..device.n_blocks)
            .map(|_| reader.take())
            .collect::<Result<Vec<BlockInfo>>>()?;
        let bitmap: Vec<u8> = reader.take()?;
        if bitmap.len() != self.blocks.len() * self.chunk_bits.stride() {
            return Err(FlashError::CorruptCheckpoint(format!(
                "bitmap of {} bytes",
                bitmap.len()
            )));
        }

        let mut objects = Vec::new();
        while let Some(record) = reader.take::<Option<ObjectRecord>>()? {
            let mut tnodes = Vec::new();
            if record.obj_type == ObjectType::File {
                while let Some(tnode) = reader.take::<Option<TnodeRecord>>()? {
                    tnodes.push(tnode);
                }
            }
            objects.push((record, tnodes));
        }
        reader.expect_marker(false)?;
        if !reader.bytes.is_empty() {
            return Err(FlashError::CorruptCheckpoint(format!(
                "{} bytes after the tail marker",
                reader.bytes.len()
            )));
        }
        Ok(CheckpointImage {
            device,
            blocks,
            bitmap,
            objects,
        })
    }

    fn restore_object(&mut self, record: &ObjectRecord, tnodes: &[TnodeRecord]) -> Result<()> {
        let corrupt = |what: String| FlashError::CorruptCheckpoint(what);
        let id = self.find_or_create_object(record.id, record.obj_type)?;
        if self.obj(id)?.object_type() != record.obj_type {
            return Err(corrupt(format!(
                "object {id} restored as {:?} but exists as {:?}",
                record.obj_type,
                self.obj(id)?.object_type()
            )));
        }
        if record.parent_id > 0 {
            let parent = self.find_or_create_object(record.parent_id, ObjectType::Directory)?;
            if !self.obj(parent)?.is_directory() {
                return Err(corrupt(format!(
                    "parent {parent} of object {id} is not a directory"
                )));
            }
            self.add_to_directory(parent, id)?;
        }

        let obj = self.obj_mut(id)?;
        obj.hdr_chunk = record.hdr_chunk;
        obj.deleted = record.deleted;
        obj.soft_deleted = record.soft_deleted;
        obj.unlinked = record.unlinked;
        obj.fake = record.fake;
        obj.rename_allowed = record.rename_allowed;
        obj.unlink_allowed = record.unlink_allowed;
        obj.serial = record.serial;
        obj.n_data_chunks = record.n_data_chunks;
        obj.valid = true;
        obj.lazy_loaded = record.hdr_chunk > 0;
        match &mut obj.kind {
            ObjectKind::File(file) => {
                file.file_size = record.size_or_equiv;
                file.scanned_size = record.size_or_equiv;
                for tnode in tnodes {
                    if !file.tree.insert_level0(tnode.base_offset, &tnode.entries) {
                        return Err(corrupt(format!(
                            "tnode at {} of object {id} out of range",
                            tnode.base_offset
                        )));
                    }
                }
            }
            ObjectKind::Hardlink { equiv_id } => *equiv_id = record.size_or_equiv as ObjectId,
            _ => {}
        }
        Ok(())
    }

    fn apply_checkpoint(&mut self, image: CheckpointImage) -> Result<()> {
        self.blocks = image.blocks;
        let stride = self.chunk_bits.stride();
        for (i, bytes) in image.bitmap.chunks(stride).enumerate() {
            self.chunk_bits.load_block_bytes(i, bytes);
        }

        let mut hardlinks = Vec::new();
        for (record, tnodes) in &image.objects {
            self.restore_object(record, tnodes)?;
            if record.obj_type == ObjectType::Hardlink {
                hardlinks.push(record.id);
            }
        }
        self.hardlink_fixup(&hardlinks);

        // adding objects to the hidden directories counted them again
        let device = image.device;
        self.n_erased_blocks = device.n_erased_blocks;
        self.alloc_block = device.alloc_block;
        self.alloc_page = device.alloc_page;
        self.n_free_chunks = device.n_free_chunks;
        self.n_deleted_files = device.n_deleted_files;
        self.n_unlinked_files = device.n_unlinked_files;
        self.n_bg_deletions = device.n_bg_deletions;
        self.seq_number = device.seq_number;

        if self.config.disable_lazy_load {
            for id in self.objects.ids() {
                self.load_object_details(id)?;
            }
        }
        Ok(())
    }

    fn read_checkpoint(&mut self) -> Result<Option<(CheckpointImage, Vec<u32>)>> {
        let Some((stream, blocks)) = self.read_checkpoint_stream()? else {
            return Ok(None);
        };
        let image = self.decode_checkpoint(&stream)?;
        Ok(Some((image, blocks)))
    }

    /// rebuild the in memory state from the checkpoint on flash
    /// # Return
    /// `false` if there is no usable checkpoint; the state is then
    /// to be rebuilt by a scan
    pub(crate) fn restore_checkpoint(&mut self) -> bool {
        let (image, blocks) = match self.read_checkpoint() {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("no checkpoint on {}", self.config.name);
                return false;
            }
            Err(e) => {
                warn!("checkpoint of {} rejected: {e}", self.config.name);
                return false;
            }
        };
        if let Err(e) = self.apply_checkpoint(image) {
            warn!("checkpoint of {} could not be applied: {e}", self.config.name);
            return false;
        }
        self.claim_checkpoint_blocks(&blocks);
        self.ckpt.is_checkpointed = true;
        info!(
            "restored {} objects from a checkpoint in {} blocks",
            self.objects.len(),
            blocks.len()
        );
        true
    }

    /// write a checkpoint unless the one on flash is current
    /// # Return
    /// whether the device is checkpointed afterwards
    pub(crate) fn save_checkpoint(&mut self) -> bool {
        if self.ckpt.is_checkpointed {
            return true;
        }
        self.invalidate_checkpoint();
        if !self.checkpoint_required() {
            debug!("{} gets no checkpoint", self.config.name);
            return false;
        }
        let written = self
            .encode_checkpoint()
            .and_then(|stream| self.write_checkpoint_stream(&stream));
        match written {
            Ok(()) => {
                self.ckpt.is_checkpointed = true;
                self.stats.checkpoint_saves += 1;
                info!(
                    "checkpoint of {} written to {} blocks",
                    self.config.name, self.ckpt.blocks_in_checkpoint
                );
            }
            Err(e) => {
                warn!("writing checkpoint of {} failed: {e}", self.config.name);
                self.invalidate_checkpoint();
            }
        }
        self.ckpt.is_checkpointed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::test_support::*;
    use crate::OBJECTID_ROOT;

    /// what a checkpoint has to carry over, per object
    fn object_summary<N: NandDriver>(dev: &Device<N>) -> Vec<(ObjectId, Option<ObjectId>, ObjectType, u32, u64, Vec<(u32, u32)>)> {
        let mut out: Vec<_> = dev
            .objects
            .values()
            .map(|o| {
                (
                    o.id,
                    o.parent,
                    o.object_type(),
                    o.hdr_chunk,
                    o.file_size(),
                    o.file().map(|f| f.tree.entries()).unwrap_or_default(),
                )
            })
            .collect();
        out.sort();
        out
    }

    fn populated_device() -> MemDevice {
        let mut dev = small_device();
        let cb = dev.data_bytes_per_chunk() as usize;
        let d = dev.mkdir(OBJECTID_ROOT, "dir", 0o755).unwrap();
        let f = dev.create_file(d, "file", 0o644).unwrap();
        dev.write_file(f, 0, &vec![3u8; cb * 3 + 100]).unwrap();
        dev.link(OBJECTID_ROOT, "hl", f).unwrap();
        dev.symlink(OBJECTID_ROOT, "sl", 0o777, "dir/file").unwrap();
        dev.sync(false).unwrap();
        dev
    }

    #[test]
    fn restore_reproduces_the_saved_state() {
        let mut dev = populated_device();
        assert!(dev.save_checkpoint());
        assert!(dev.is_checkpointed());
        assert!(dev.blocks_in_checkpoint() > 0);
        let objects = object_summary(&dev);
        let blocks = dev.blocks.clone();
        let bitmap = dev.chunk_bits.clone();
        let n_free = dev.n_free_chunks();

        let nand = crash(dev);
        let mut dev = Device::mount(nand, test_config()).unwrap();
        assert!(dev.is_checkpointed());
        assert_eq!(object_summary(&dev), objects);
        assert_eq!(dev.blocks, blocks);
        assert_eq!(dev.chunk_bits, bitmap);
        assert_eq!(dev.n_free_chunks(), n_free);
        dev.check_invariants().unwrap();

        // lazily loaded details come from the headers
        let d = dev.lookup(OBJECTID_ROOT, "dir").unwrap();
        let f = dev.lookup(d, "file").unwrap();
        let hl = dev.lookup(OBJECTID_ROOT, "hl").unwrap();
        assert_eq!(dev.object(f).unwrap().hard_links, vec![hl]);
        let sl = dev.lookup(OBJECTID_ROOT, "sl").unwrap();
        assert_eq!(dev.read_link(sl).unwrap(), "dir/file");
    }

    #[test]
    fn the_next_write_invalidates_the_checkpoint() {
        let mut dev = populated_device();
        assert!(dev.save_checkpoint());
        dev.create_file(OBJECTID_ROOT, "new", 0o644).unwrap();
        assert!(!dev.is_checkpointed());
        assert_eq!(dev.blocks_in_checkpoint(), 0);
        assert!(dev
            .block_range()
            .all(|b| dev.block(b).unwrap().state != crate::BlockState::Checkpoint));
        dev.check_invariants().unwrap();
    }

    #[test]
    fn corrupt_checkpoint_falls_back_to_a_scan() {
        let mut dev = populated_device();
        assert!(dev.save_checkpoint());
        let block = dev
            .block_range()
            .find(|&b| dev.block(b).unwrap().state == crate::BlockState::Checkpoint)
            .unwrap();
        let nand_chunk = (block - dev.block_offset) * dev.chunks_per_block();
        let mut nand = crash(dev);
        nand.corrupt_chunk(nand_chunk, 10).unwrap();

        let mut dev = Device::mount(nand, test_config()).unwrap();
        assert!(!dev.is_checkpointed());
        assert_eq!(dev.blocks_in_checkpoint(), 0);
        let d = dev.lookup(OBJECTID_ROOT, "dir").unwrap();
        let f = dev.lookup(d, "file").unwrap();
        let mut buf = [0u8; 4];
        dev.read_file(f, 5, &mut buf).unwrap();
        assert_eq!(buf, [3; 4]);
        dev.check_invariants().unwrap();
    }

    #[test]
    fn decoding_rejects_a_flipped_byte() {
        let dev = populated_device();
        let mut stream = dev.encode_checkpoint().unwrap();
        assert!(dev.decode_checkpoint(&stream).is_ok());
        stream[7] ^= 1;
        assert!(matches!(
            dev.decode_checkpoint(&stream),
            Err(FlashError::CorruptCheckpoint(_))
        ));
    }

    #[test]
    fn small_devices_get_no_checkpoint() {
        let mut dev = device_with(|c| c.checkpoint_min_blocks = 1000);
        assert_eq!(dev.checkpoint_blocks_required(), 0);
        assert!(!dev.save_checkpoint());
        assert_eq!(dev.blocks_in_checkpoint(), 0);
    }
}
