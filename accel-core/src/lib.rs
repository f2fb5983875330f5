//! Hardware-facing primitives for accelerator compute-unit scheduling.
//!
//! This crate holds the pieces of the execution stack that talk about the
//! hardware itself, independent of any scheduling policy:
//!
//! - Fixed-capacity bitmask resource pools ([`bitmask`])
//! - Command packets and their payload layouts ([`packet`])
//! - The compute-unit model and register adapter contract ([`cu`])
//! - Collaborator contracts for soft (emulated) CUs ([`softcu`]) and the
//!   asynchronous copy engine ([`copy`])
//!
//! The scheduler crate consumes these through narrow trait seams so that
//! real register I/O stays outside this crate entirely.

pub mod bitmask;
pub mod copy;
pub mod cu;
pub mod packet;
pub mod softcu;

/// Command queue size in bytes. Slot count is derived from the slot size
/// carried by the configure command.
pub const CQ_SIZE: usize = 64 * 1024;

/// Maximum number of command queue slots.
pub const MAX_SLOTS: usize = 128;

/// Maximum number of compute units, hard or soft.
pub const MAX_CUS: usize = 128;

/// Resources are tracked 32 to a mask word.
pub const MASK_BITS: usize = 32;

/// Number of 32-bit words covering all slots.
pub const MAX_SLOT_MASKS: usize = MAX_SLOTS / MASK_BITS;

/// Number of 32-bit words covering all CUs.
pub const MAX_CU_MASKS: usize = MAX_CUS / MASK_BITS;

/// Index of the mask word containing bit `idx`.
#[inline]
pub fn mask_idx(idx: usize) -> usize {
    idx >> 5
}

/// Position of `idx` within its mask word.
#[inline]
pub fn idx_in_mask(idx: usize) -> usize {
    idx & (MASK_BITS - 1)
}

/// Global index from a bit position and a mask word index.
#[inline]
pub fn idx_from_mask(bit: usize, word: usize) -> usize {
    (word << 5) + bit
}

/// First set bit of a 32-bit mask, or `None` when the mask is empty.
#[inline]
pub fn first_set(mask: u32) -> Option<usize> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros() as usize)
    }
}

/// First zero bit of a 32-bit mask, or `None` when it is saturated.
#[inline]
pub fn first_zero(mask: u32) -> Option<usize> {
    if mask == u32::MAX {
        None
    } else {
        Some(mask.trailing_ones() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_index_round_trip() {
        for idx in [0usize, 1, 31, 32, 63, 127] {
            assert_eq!(idx_from_mask(idx_in_mask(idx), mask_idx(idx)), idx);
        }
    }

    #[test]
    fn first_set_and_zero() {
        assert_eq!(first_set(0), None);
        assert_eq!(first_set(0b1000), Some(3));
        assert_eq!(first_zero(u32::MAX), None);
        assert_eq!(first_zero(0b0111), Some(3));
    }
}
