//! Indexer cursor: tracks the current position in the chain.

use serde::{Deserialize, Serialize};

/// The indexer's current position in the chain.
///
/// The cursor knows:
/// - Which block is processed next
/// - The hash of the last processed block, once there is one
/// - The confirmation depth (how many blocks behind head count as confirmed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Next block number to process.
    pub next_block: u64,
    /// Hash of block `next_block - 1`, if it was processed.
    pub last_hash: Option<String>,
    pub confirmation_depth: u64,
}

impl Cursor {
    /// A cursor that starts at `from_block`.
    pub fn new(from_block: u64, confirmation_depth: u64) -> Self {
        Self {
            next_block: from_block,
            last_hash: None,
            confirmation_depth,
        }
    }

    /// Record that `block_number` was processed.
    pub fn advance(&mut self, block_number: u64, block_hash: impl Into<String>) {
        self.next_block = block_number + 1;
        self.last_hash = Some(block_hash.into());
    }

    /// Move back so that `block_number` is processed next.
    pub fn rewind_to(&mut self, block_number: u64, parent_hash: Option<String>) {
        self.next_block = block_number;
        self.last_hash = parent_hash;
    }

    /// Returns `true` if `head_number` is far enough ahead for `target` to be confirmed.
    pub fn is_confirmed(&self, target: u64, head_number: u64) -> bool {
        head_number.saturating_sub(target) >= self.confirmation_depth
            && head_number >= target
    }

    /// Highest confirmed block given the source's head, if any.
    pub fn confirmed_tip(&self, head_number: u64) -> Option<u64> {
        head_number.checked_sub(self.confirmation_depth)
    }

    /// Last processed block number, if any.
    pub fn last_block(&self) -> Option<u64> {
        self.last_hash.as_ref().and(self.next_block.checked_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance() {
        let mut cursor = Cursor::new(100, 12);
        assert_eq!(cursor.last_block(), None);
        cursor.advance(100, "0xbbb");
        assert_eq!(cursor.next_block, 101);
        assert_eq!(cursor.last_block(), Some(100));
        assert_eq!(cursor.last_hash.as_deref(), Some("0xbbb"));
    }

    #[test]
    fn cursor_confirmation_depth() {
        let cursor = Cursor::new(100, 12);
        assert!(cursor.is_confirmed(100, 112)); // 112 - 100 = 12 ≥ 12
        assert!(!cursor.is_confirmed(100, 111)); // 111 - 100 = 11 < 12
        assert_eq!(cursor.confirmed_tip(111), Some(99));
        assert_eq!(cursor.confirmed_tip(5), None);
    }

    #[test]
    fn cursor_rewind() {
        let mut cursor = Cursor::new(0, 0);
        cursor.advance(50, "0x50");
        cursor.rewind_to(40, Some("0x39".into()));
        assert_eq!(cursor.next_block, 40);
        assert_eq!(cursor.last_block(), Some(39));
    }
}
