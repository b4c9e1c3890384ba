//! short operation cache: whole chunks of data held for partial reads and writes
use log::{error, trace};

use crate::error::Result;
use crate::nand::NandDriver;

use super::device::Device;
use super::ObjectId;

/// `last_use` counters are renumbered when they pass this
const USE_COUNTER_LIMIT: u64 = 100_000_000;

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    /// owner of the cached chunk, 0 when the entry is free
    pub obj_id: ObjectId,
    pub chunk_id: u32,
    pub last_use: u64,
    pub dirty: bool,
    /// valid bytes in `data`
    pub n_bytes: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct ChunkCache {
    entries: Vec<CacheEntry>,
    use_counter: u64,
}

impl ChunkCache {
    pub fn new(n_entries: u32, chunk_bytes: u32) -> Self {
        let entry = CacheEntry {
            obj_id: 0,
            chunk_id: 0,
            last_use: 0,
            dirty: false,
            n_bytes: 0,
            data: vec![0; chunk_bytes as usize],
        };
        ChunkCache {
            entries: vec![entry; n_entries as usize],
            use_counter: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn n_dirty(&self) -> usize {
        self.entries.iter().filter(|e| e.obj_id != 0 && e.dirty).count()
    }

    pub fn has_dirty(&self, obj_id: ObjectId) -> bool {
        self.entries.iter().any(|e| e.obj_id == obj_id && e.dirty)
    }

    pub fn entry(&self, index: usize) -> &CacheEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut CacheEntry {
        &mut self.entries[index]
    }

    pub fn find(&self, obj_id: ObjectId, chunk_id: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.obj_id == obj_id && e.chunk_id == chunk_id)
    }

    /// bump an entry to most recently used
    pub fn mark_use(&mut self, index: usize, is_write: bool) {
        if self.use_counter > USE_COUNTER_LIMIT {
            self.use_counter = 0;
            for e in &mut self.entries {
                e.last_use = 0;
            }
        }
        self.use_counter += 1;
        let entry = &mut self.entries[index];
        entry.last_use = self.use_counter;
        if is_write {
            entry.dirty = true;
        }
    }

    fn empty_entry(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.obj_id == 0)
    }

    /// least recently used entry in use
    fn lru_entry(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.obj_id != 0)
            .min_by_key(|(_, e)| e.last_use)
            .map(|(i, _)| i)
    }

    /// dirty entry of `obj_id` with the lowest chunk id
    fn lowest_dirty(&self, obj_id: ObjectId) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.obj_id == obj_id && e.dirty)
            .min_by_key(|(_, e)| e.chunk_id)
            .map(|(i, _)| i)
    }

    fn first_dirty_object(&self) -> Option<ObjectId> {
        self.entries
            .iter()
            .find(|e| e.obj_id != 0 && e.dirty)
            .map(|e| e.obj_id)
    }

    pub fn free_entry(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.obj_id = 0;
        entry.dirty = false;
    }

    /// drop a cached chunk without writing it
    pub fn invalidate_chunk(&mut self, obj_id: ObjectId, chunk_id: u32) {
        if let Some(index) = self.find(obj_id, chunk_id) {
            self.free_entry(index);
        }
    }

    /// drop every cached chunk of an object without writing them
    pub fn invalidate_object(&mut self, obj_id: ObjectId) {
        for e in self.entries.iter_mut().filter(|e| e.obj_id == obj_id) {
            e.obj_id = 0;
            e.dirty = false;
        }
    }

    pub fn invalidate_all(&mut self) {
        for e in &mut self.entries {
            e.obj_id = 0;
            e.dirty = false;
        }
    }
}

impl<N: NandDriver> Device<N> {
    /// cache entry of a chunk, counting the hit
    pub(crate) fn find_chunk_cache(&mut self, obj_id: ObjectId, chunk_id: u32) -> Option<usize> {
        let found = self.cache.find(obj_id, chunk_id);
        if found.is_some() {
            self.stats.cache_hits += 1;
        }
        found
    }

    /// write out the dirty cached chunks of an object, lowest chunk first
    pub(crate) fn flush_file_cache(&mut self, obj_id: ObjectId) -> Result<()> {
        while let Some(index) = self.cache.lowest_dirty(obj_id) {
            let entry = self.cache.entry(index);
            let (chunk_id, n_bytes) = (entry.chunk_id, entry.n_bytes as usize);
            let data = entry.data[..n_bytes].to_vec();
            trace!("flushing cached chunk {chunk_id} of object {obj_id}");
            if let Err(e) = self.write_chunk_data_to_object(obj_id, chunk_id, &data, true) {
                error!("no space while writing the cache of object {obj_id} out: {e}");
                return Err(e);
            }
            self.cache.free_entry(index);
        }
        Ok(())
    }

    pub(crate) fn flush_entire_cache(&mut self) -> Result<()> {
        while let Some(obj_id) = self.cache.first_dirty_object() {
            self.flush_file_cache(obj_id)?;
        }
        Ok(())
    }

    /// a cache entry to load a chunk into, evicting if needed
    pub(crate) fn grab_chunk_cache(&mut self) -> Result<Option<usize>> {
        if !self.cache.is_enabled() {
            return Ok(None);
        }
        if let Some(index) = self.cache.empty_entry() {
            return Ok(Some(index));
        }
        match self.cache.lru_entry() {
            Some(index) if !self.cache.entry(index).dirty => Ok(Some(index)),
            Some(index) => {
                let victim = self.cache.entry(index).obj_id;
                self.flush_file_cache(victim)?;
                Ok(self.cache.empty_entry())
            }
            None => Ok(None),
        }
    }
}
