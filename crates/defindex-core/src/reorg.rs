//! Reorg detection.
//!
//! Handles three ways a reorganization shows up:
//! 1. **Parent mismatch**: the next block does not extend the recorded head
//! 2. **Hash mismatch**: the source reports a different hash for a block
//!    already recorded as canonical
//! 3. **Head regression**: the source's head drops below blocks we have
//!    already processed
//!
//! Detection only estimates the fork height from the tracked window; the
//! index loop confirms it against the source before rewinding.

use crate::types::BlockSummary;

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// The block number at which the mismatch was seen.
    pub detected_at: u64,
    /// Lowest block number that is no longer canonical (H).
    pub fork_height: u64,
    /// The recorded blocks at or above `fork_height`, most recent first.
    pub dropped_blocks: Vec<BlockSummary>,
    /// Number of recorded blocks rolled back.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

impl ReorgEvent {
    /// Re-anchor the event on a confirmed fork height.
    pub fn with_fork_height(mut self, fork_height: u64, window: &[BlockSummary]) -> Self {
        self.fork_height = fork_height;
        self.dropped_blocks = dropped_from(fork_height, window);
        self.depth = self.dropped_blocks.len() as u64;
        self
    }
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Parent hash mismatch on the next block.
    ParentMismatch,
    /// A recorded block's hash changed.
    HashMismatch,
    /// The source's head fell below processed blocks.
    HeadRegression,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParentMismatch => write!(f, "parent mismatch"),
            Self::HashMismatch => write!(f, "hash mismatch"),
            Self::HeadRegression => write!(f, "head regression"),
        }
    }
}

/// Detects and classifies chain reorganizations.
#[derive(Debug, Default)]
pub struct ReorgDetector {
    /// Highest head number reported by the source.
    last_head: Option<u64>,
    /// Reorgs detected so far.
    detected: u64,
}

impl ReorgDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reorgs detected since construction.
    pub fn detected(&self) -> u64 {
        self.detected
    }

    /// Check whether `new_block` extends `previous_head` normally.
    ///
    /// Returns `Some(ReorgEvent)` if it does not. The fork height is
    /// estimated as one past the newest window block that `new_block`'s
    /// parent hash matches.
    pub fn check(
        &mut self,
        new_block: &BlockSummary,
        previous_head: &BlockSummary,
        window: &[BlockSummary],
    ) -> Option<ReorgEvent> {
        if new_block.extends(previous_head) {
            return None;
        }
        let fork_height = window
            .iter()
            .rev()
            .find(|b| b.hash == new_block.parent_hash)
            .map(|b| b.number + 1)
            .unwrap_or_else(|| oldest(window, previous_head.number));
        Some(self.report(new_block.number, fork_height, window, ReorgType::ParentMismatch))
    }

    /// Compare a recorded canonical block with what the source reports now.
    pub fn check_recorded(
        &mut self,
        recorded: &BlockSummary,
        fetched: &BlockSummary,
        window: &[BlockSummary],
    ) -> Option<ReorgEvent> {
        if recorded.number != fetched.number || recorded.hash == fetched.hash {
            return None;
        }
        Some(self.report(recorded.number, recorded.number, window, ReorgType::HashMismatch))
    }

    /// Check the source's head against processed blocks.
    pub fn check_head(&mut self, head: u64, window: &[BlockSummary]) -> Option<ReorgEvent> {
        let previous = self.last_head.replace(head);
        let processed = window.last().map(|b| b.number)?;
        match previous {
            Some(prev) if head < prev && head < processed => {
                tracing::warn!(
                    last_head = prev,
                    new_head = head,
                    "Source head moved backwards"
                );
                Some(self.report(head, head + 1, window, ReorgType::HeadRegression))
            }
            _ => None,
        }
    }

    fn report(
        &mut self,
        detected_at: u64,
        fork_height: u64,
        window: &[BlockSummary],
        reorg_type: ReorgType,
    ) -> ReorgEvent {
        self.detected += 1;
        let dropped = dropped_from(fork_height, window);
        let depth = dropped.len() as u64;
        tracing::warn!(
            depth,
            at = detected_at,
            fork_height,
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        ReorgEvent {
            detected_at,
            fork_height,
            dropped_blocks: dropped,
            depth,
            reorg_type,
        }
    }
}

fn oldest(window: &[BlockSummary], fallback: u64) -> u64 {
    window.first().map(|b| b.number).unwrap_or(fallback)
}

/// Window blocks at or above `height`, most recent first.
fn dropped_from(height: u64, window: &[BlockSummary]) -> Vec<BlockSummary> {
    window
        .iter()
        .rev()
        .take_while(|b| b.number >= height)
        .cloned()
        .collect()
}
