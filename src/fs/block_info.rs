//! per block bookkeeping driving allocation and garbage collection
use serde::{Deserialize, Serialize};

/// life cycle state of an erase block
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Unknown,
    /// used but not yet classified by the mount scan
    NeedsScanning,
    Empty,
    /// the block chunks are currently allocated from
    Allocating,
    Full,
    /// every chunk is free, the block waits for its erase
    Dirty,
    Checkpoint,
    /// garbage collection is moving its live chunks out
    Collecting,
    /// bad or retired
    Dead,
}

impl BlockState {
    /// states whose chunks take part in free space accounting
    pub fn holds_file_system_chunks(self) -> bool {
        matches!(
            self,
            BlockState::Empty | BlockState::Allocating | BlockState::Collecting | BlockState::Full
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// chunks of soft deleted files still counted in `pages_in_use`
    pub soft_deletions: u32,
    pub pages_in_use: u32,
    pub state: BlockState,
    /// retire instead of erase once the block is emptied
    pub needs_retiring: bool,
    /// chunks are known to be erased, no need to check before writing
    pub skip_erased_check: bool,
    /// collect this block as soon as possible
    pub gc_prioritise: bool,
    pub chunk_error_strikes: u8,
    /// holds a shrink header, which older blocks depend on
    pub has_shrink_header: bool,
    pub seq_number: u32,
}

impl BlockInfo {
    /// pages still holding live data
    pub fn live_pages(&self) -> u32 {
        self.pages_in_use.saturating_sub(self.soft_deletions)
    }
}
