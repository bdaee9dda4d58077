//! Block tracker: keeps a sliding window of recently processed block
//! headers for parent-hash verification and fork location.

use std::collections::VecDeque;

use crate::types::BlockSummary;

/// Tracks the last N processed block headers.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the previous block. A mismatch means a reorg occurred.
#[derive(Debug)]
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockSummary>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `Err(depth)` on a parent hash mismatch, where `depth` is the
    /// number of tracked blocks above the common ancestor (the whole window
    /// if no ancestor is tracked). The block is not recorded in that case.
    pub fn push(&mut self, block: BlockSummary) -> Result<(), u64> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(self.find_reorg_depth(&block));
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// The most recently recorded block.
    pub fn head(&self) -> Option<&BlockSummary> {
        self.window.back()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&BlockSummary> {
        let first = self.window.front()?.number;
        let idx = number.checked_sub(first)? as usize;
        self.window.get(idx).filter(|b| b.number == number)
    }

    /// Tracked blocks, oldest first.
    pub fn blocks(&self) -> Vec<BlockSummary> {
        self.window.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Discard every block above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while self.window.back().is_some_and(|b| b.number > block_number) {
            self.window.pop_back();
        }
    }

    /// Drop everything and start from the given blocks (ascending).
    pub fn reset(&mut self, blocks: impl IntoIterator<Item = BlockSummary>) {
        self.window.clear();
        for block in blocks {
            if self.window.len() >= self.window_size {
                self.window.pop_front();
            }
            self.window.push_back(block);
        }
    }

    fn find_reorg_depth(&self, new_block: &BlockSummary) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_block.parent_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        self.window.len() as u64
    }
}
