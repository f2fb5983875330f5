//! Bitmask-backed resource tracking.
//!
//! Two layers: [`Bitmap`], a raw fixed-width bit vector exposed word by word
//! for mask arithmetic, and [`BitmaskAllocator`], a first-fit index
//! allocator over a `Bitmap` used for command queue slots.

use crate::{first_zero, idx_from_mask, idx_in_mask, mask_idx, MASK_BITS};

/// Fixed-width bit vector stored as 32-bit words.
///
/// Bit `i` of word `w` corresponds to resource index `w * 32 + i`. Busy,
/// valid and initialized CU masks are all plain `Bitmap`s; their update
/// rules live with the execution core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u32>,
}

impl Bitmap {
    /// A bitmap covering `bits` indices, all clear.
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(MASK_BITS)],
        }
    }

    /// Number of mask words.
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Raw mask word, zero when `word` is out of range.
    pub fn word(&self, word: usize) -> u32 {
        self.words.get(word).copied().unwrap_or(0)
    }

    /// Set bit `idx`. Out-of-range indices are ignored; request masks come
    /// straight from client packets and must not be able to blow up the
    /// owning thread.
    pub fn set(&mut self, idx: usize) {
        if let Some(word) = self.words.get_mut(mask_idx(idx)) {
            *word |= 1 << idx_in_mask(idx);
        }
    }

    /// Clear bit `idx`. Out-of-range indices are ignored.
    pub fn clear(&mut self, idx: usize) {
        if let Some(word) = self.words.get_mut(mask_idx(idx)) {
            *word &= !(1 << idx_in_mask(idx));
        }
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.word(mask_idx(idx)) & (1 << idx_in_mask(idx)) != 0
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// First-fit allocator over a fixed pool of indices.
///
/// `acquire` always returns the lowest free index. Capacity is set once at
/// construction and never changes for the life of the device.
#[derive(Debug)]
pub struct BitmaskAllocator {
    busy: Bitmap,
    capacity: usize,
}

impl BitmaskAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            busy: Bitmap::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the lowest free index, marking it busy.
    ///
    /// Returns `None` when every index is held. Not an error; callers retry
    /// after a release.
    pub fn acquire(&mut self) -> Option<usize> {
        for word in 0..self.busy.num_words() {
            let Some(bit) = first_zero(self.busy.word(word)) else {
                continue;
            };
            let idx = idx_from_mask(bit, word);
            if idx >= self.capacity {
                continue;
            }
            self.busy.set(idx);
            return Some(idx);
        }
        None
    }

    /// Release a held index.
    ///
    /// Returns `false` if the index was not held; releasing a free index is
    /// a logic error the caller must escalate, not a recoverable condition.
    #[must_use]
    pub fn release(&mut self, idx: usize) -> bool {
        if idx >= self.capacity || !self.busy.is_set(idx) {
            log::warn!("release of unheld index {idx} (capacity {})", self.capacity);
            return false;
        }
        self.busy.clear(idx);
        true
    }

    pub fn is_held(&self, idx: usize) -> bool {
        self.busy.is_set(idx)
    }

    /// Number of indices currently held.
    pub fn held(&self) -> usize {
        (0..self.busy.num_words())
            .map(|w| self.busy.word(w).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_lowest_first() {
        let mut alloc = BitmaskAllocator::new(4);
        assert_eq!(alloc.acquire(), Some(0));
        assert_eq!(alloc.acquire(), Some(1));
        assert_eq!(alloc.acquire(), Some(2));
        assert_eq!(alloc.acquire(), Some(3));
        assert_eq!(alloc.acquire(), None);
    }

    #[test]
    fn release_reopens_lowest_hole() {
        let mut alloc = BitmaskAllocator::new(8);
        for _ in 0..8 {
            alloc.acquire().unwrap();
        }
        assert!(alloc.release(3));
        assert!(alloc.release(5));
        assert_eq!(alloc.acquire(), Some(3));
        assert_eq!(alloc.acquire(), Some(5));
    }

    #[test]
    fn at_most_capacity_outstanding() {
        let mut alloc = BitmaskAllocator::new(33);
        let mut held = Vec::new();
        while let Some(idx) = alloc.acquire() {
            held.push(idx);
        }
        assert_eq!(held.len(), 33);
        assert_eq!(alloc.held(), 33);
        held.dedup();
        assert_eq!(held.len(), 33);
    }

    #[test]
    fn double_release_is_reported() {
        let mut alloc = BitmaskAllocator::new(2);
        let idx = alloc.acquire().unwrap();
        assert!(alloc.release(idx));
        assert!(!alloc.release(idx));
        assert!(!alloc.release(17));
    }

    #[test]
    fn capacity_beyond_one_word() {
        let mut alloc = BitmaskAllocator::new(40);
        for expect in 0..40 {
            assert_eq!(alloc.acquire(), Some(expect));
        }
        assert_eq!(alloc.acquire(), None);
        assert!(alloc.release(39));
        assert_eq!(alloc.acquire(), Some(39));
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let mut map = Bitmap::new(64);
        map.set(64);
        map.set(1000);
        assert!(map.is_empty());
        assert!(!map.is_set(64));
        map.clear(64);
        assert_eq!(map.word(2), 0);
    }

    #[test]
    fn bitmap_word_access() {
        let mut map = Bitmap::new(64);
        map.set(0);
        map.set(33);
        assert_eq!(map.word(0), 1);
        assert_eq!(map.word(1), 2);
        assert!(!map.is_empty());
        map.clear(0);
        map.clear(33);
        assert!(map.is_empty());
    }
}
