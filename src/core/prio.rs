//! Priority bitmap for the reference task-selection policy
//!
//! One bit per priority level, bit 0 of word 0 being priority 0 (highest).
//! The highest ready priority is the lowest set bit, found with a
//! trailing-zero count per word.

use crate::config::CFG_PRIO_MAX;
use crate::types::OsPrio;

const PRIO_WORDS: usize = CFG_PRIO_MAX.div_ceil(64);

/// Priority bitmap table
#[derive(Debug, Clone, Default)]
pub struct PrioTable {
    bitmap: [u64; PRIO_WORDS],
}

impl PrioTable {
    pub const fn new() -> Self {
        PrioTable {
            bitmap: [0; PRIO_WORDS],
        }
    }

    #[inline]
    fn locate(prio: OsPrio) -> (usize, u64) {
        debug_assert!((prio as usize) < CFG_PRIO_MAX);
        ((prio as usize) / 64, 1u64 << (prio % 64))
    }

    /// Mark a priority as having ready tasks
    #[inline]
    pub fn insert(&mut self, prio: OsPrio) {
        let (word, mask) = Self::locate(prio);
        self.bitmap[word] |= mask;
    }

    /// Mark a priority as empty
    #[inline]
    pub fn remove(&mut self, prio: OsPrio) {
        let (word, mask) = Self::locate(prio);
        self.bitmap[word] &= !mask;
    }

    #[inline]
    pub fn is_set(&self, prio: OsPrio) -> bool {
        let (word, mask) = Self::locate(prio);
        self.bitmap[word] & mask != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|&w| w == 0)
    }

    /// Highest ready priority, `None` when nothing is ready
    pub fn highest(&self) -> Option<OsPrio> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(i, word)| (i * 64 + word.trailing_zeros() as usize) as OsPrio)
    }
}
