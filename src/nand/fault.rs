//! a [NandDriver] decorator that injects failures, for exercising the
//! self healing paths of the filesystem core
use std::collections::HashSet;

use log::debug;

use crate::error::{FlashError, Result};
use crate::nand::{ExtendedTags, NandDriver, NandGeometry};

/// counters of the operations that reached the wrapped driver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NandOpCounters {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
}

#[derive(Debug)]
pub struct FaultyNand<N> {
    inner: N,
    /// chunks whose next program fails (the bits are still disturbed)
    pub fail_writes: HashSet<u32>,
    /// blocks that can't be erased
    pub fail_erases: HashSet<u32>,
    /// reject every attempt to mark a block bad
    pub fail_mark_bad: bool,
    /// after this many more programs or erases the power is gone:
    /// further operations report success but change nothing
    programs_before_power_cut: Option<u64>,
    pub counters: NandOpCounters,
}

impl<N: NandDriver> FaultyNand<N> {
    pub fn new(inner: N) -> Self {
        FaultyNand {
            inner,
            fail_writes: HashSet::new(),
            fail_erases: HashSet::new(),
            fail_mark_bad: false,
            programs_before_power_cut: None,
            counters: NandOpCounters::default(),
        }
    }

    /// let `n` more programs or erases through, then drop everything
    pub fn cut_power_after(&mut self, n: u64) {
        self.programs_before_power_cut = Some(n);
    }

    pub fn power_is_cut(&self) -> bool {
        self.programs_before_power_cut == Some(0)
    }

    pub fn into_inner(self) -> N {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut N {
        &mut self.inner
    }

    /// consume one program from the power budget
    /// # Return
    /// `false` if the power is already gone
    fn spend_program(&mut self) -> bool {
        match self.programs_before_power_cut.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

impl<N: NandDriver> NandDriver for FaultyNand<N> {
    fn geometry(&self) -> NandGeometry {
        self.inner.geometry()
    }

    fn read_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: Option<&mut [u8]>,
    ) -> Result<ExtendedTags> {
        self.counters.reads += 1;
        self.inner.read_chunk_with_tags(chunk, data)
    }

    fn write_chunk_with_tags(
        &mut self,
        chunk: u32,
        data: &[u8],
        tags: &ExtendedTags,
    ) -> Result<()> {
        if !self.spend_program() {
            return Ok(());
        }
        self.counters.writes += 1;
        if self.fail_writes.remove(&chunk) {
            debug!("injected program failure on chunk {chunk}");
            let garbage = vec![0x55u8; data.len()];
            self.inner.write_chunk_with_tags(chunk, &garbage, tags)?;
            return Err(FlashError::WriteVerifyFailed { chunk });
        }
        self.inner.write_chunk_with_tags(chunk, data, tags)
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        if !self.spend_program() {
            return Ok(());
        }
        self.counters.erases += 1;
        if self.fail_erases.contains(&block) {
            debug!("injected erase failure on block {block}");
            return Err(FlashError::EraseFailed { block });
        }
        self.inner.erase_block(block)
    }

    fn mark_block_bad(&mut self, block: u32) -> Result<()> {
        if self.fail_mark_bad {
            return Err(FlashError::MarkBadFailed { block });
        }
        self.inner.mark_block_bad(block)
    }

    fn is_block_bad(&mut self, block: u32) -> Result<bool> {
        self.inner.is_block_bad(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::FlashImage;

    fn tags(obj_id: u32) -> ExtendedTags {
        ExtendedTags {
            chunk_used: true,
            obj_id,
            chunk_id: 1,
            n_bytes: 4,
            seq_number: 0x1000,
            ..Default::default()
        }
    }

    #[test]
    fn power_cut_drops_later_programs() {
        let mut nand = FaultyNand::new(FlashImage::in_memory(2, 4, 512));
        nand.cut_power_after(1);
        nand.write_chunk_with_tags(0, &[1; 4], &tags(7)).unwrap();
        nand.write_chunk_with_tags(1, &[1; 4], &tags(8)).unwrap();
        assert!(nand.power_is_cut());
        let mut image = nand.into_inner();
        assert!(image.read_chunk_with_tags(0, None).unwrap().chunk_used);
        assert!(!image.read_chunk_with_tags(1, None).unwrap().chunk_used);
    }

    #[test]
    fn failed_program_is_reported_once() {
        let mut nand = FaultyNand::new(FlashImage::in_memory(2, 4, 512));
        nand.fail_writes.insert(2);
        assert!(matches!(
            nand.write_chunk_with_tags(2, &[1; 4], &tags(7)),
            Err(FlashError::WriteVerifyFailed { chunk: 2 })
        ));
        assert!(nand.fail_writes.is_empty());
        nand.fail_erases.insert(1);
        assert!(nand.erase_block(1).is_err());
        assert!(nand.erase_block(0).is_ok());
        assert_eq!(nand.counters.erases, 2);
    }
}
