//! Bit-packed words of the property area
//!
//! Two 32-bit encodings live in the area and are shared with anyone mapping
//! the same binary layout:
//!
//! ```text
//! serial word (one per record)
//! ┌────────────┬───────────────────────────┬───────┐
//! │ 31 ..  24  │ 23  ..  1                 │   0   │
//! │ value len  │ generation                │ dirty │
//! └────────────┴───────────────────────────┴───────┘
//!
//! TOC word (one per defined property)
//! ┌────────────┬───────────────────────────────────┐
//! │ 31 ..  24  │ 23  ..  0                         │
//! │ name len   │ byte offset of the record         │
//! └────────────┴───────────────────────────────────┘
//! ```
//!
//! Everything here is a pure function over `u32`, so the encodings can be
//! tested in isolation from the atomics that carry them.

use crate::area::{PA_INFO_SIZE, PA_INFO_START};

const DIRTY_BIT: u32 = 1;
const LOW_MASK: u32 = 0x00FF_FFFF;
const GENERATION_SHIFT: u32 = 1;
const LEN_SHIFT: u32 = 24;

/// Serial of a freshly appended record: clean, generation zero.
#[must_use]
pub const fn initial(value_len: usize) -> u32 {
    (value_len as u32) << LEN_SHIFT
}

/// Whether a writer is in the middle of mutating the value buffer.
#[must_use]
pub const fn is_dirty(serial: u32) -> bool {
    serial & DIRTY_BIT != 0
}

/// Length of the committed value, taken from the high byte.
#[must_use]
pub const fn value_len(serial: u32) -> usize {
    (serial >> LEN_SHIFT) as usize
}

/// Generation counter, bits 1..=23.
#[must_use]
pub const fn generation(serial: u32) -> u32 {
    (serial & LOW_MASK) >> GENERATION_SHIFT
}

/// First step of a write: the same word with the dirty bit raised.
#[must_use]
pub const fn mark_dirty(serial: u32) -> u32 {
    serial | DIRTY_BIT
}

/// Final step of a write.
///
/// Takes the dirty serial and produces the published one: `new_len` in the
/// high byte, the low 24 bits advanced by one. Since the low bit is set on
/// input, the increment clears it and carries into the generation, which
/// wraps back to zero after `0x7F_FFFF`.
#[must_use]
pub const fn commit(dirty: u32, new_len: usize) -> u32 {
    ((new_len as u32) << LEN_SHIFT) | (dirty.wrapping_add(1) & LOW_MASK)
}

/// Encode a TOC word for the record at `index`.
#[must_use]
pub const fn toc_encode(name_len: usize, index: usize) -> u32 {
    ((name_len as u32) << LEN_SHIFT) | ((PA_INFO_START + index * PA_INFO_SIZE) as u32)
}

/// Name length stored in a TOC word.
#[must_use]
pub const fn toc_name_len(toc: u32) -> usize {
    (toc >> LEN_SHIFT) as usize
}

/// Raw byte offset stored in a TOC word.
#[must_use]
pub const fn toc_offset(toc: u32) -> usize {
    (toc & LOW_MASK) as usize
}

/// Record index addressed by a TOC word, or `None` if the offset does not
/// land on a record boundary.
#[must_use]
pub fn toc_index(toc: u32) -> Option<usize> {
    let offset = toc_offset(toc).checked_sub(PA_INFO_START)?;
    if offset % PA_INFO_SIZE != 0 {
        return None;
    }
    Some(offset / PA_INFO_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::PA_COUNT_MAX;
    use crate::prop_info::PROP_VALUE_MAX;

    #[test]
    fn test_initial_is_clean() {
        let serial = initial(11);
        assert!(!is_dirty(serial));
        assert_eq!(value_len(serial), 11);
        assert_eq!(generation(serial), 0);
    }

    #[test]
    fn test_length_boundaries() {
        for len in [0, 1, PROP_VALUE_MAX - 1, 255] {
            let serial = commit(mark_dirty(initial(0)), len);
            assert_eq!(value_len(serial), len);
            assert!(!is_dirty(serial));
        }
    }

    #[test]
    fn test_mark_dirty_keeps_len_and_generation() {
        let serial = commit(mark_dirty(initial(5)), 7);
        let dirty = mark_dirty(serial);
        assert!(is_dirty(dirty));
        assert_eq!(value_len(dirty), 7);
        assert_eq!(generation(dirty), generation(serial));
    }

    #[test]
    fn test_commit_advances_generation() {
        let mut serial = initial(3);
        for expected in 1..=5 {
            serial = commit(mark_dirty(serial), 3);
            assert_eq!(generation(serial), expected);
        }
    }

    #[test]
    fn test_commit_changes_len_only_in_high_byte() {
        let before = commit(mark_dirty(initial(90)), 90);
        let after = commit(mark_dirty(before), 0);
        assert_eq!(value_len(after), 0);
        assert_eq!(generation(after), generation(before) + 1);
    }

    #[test]
    fn test_generation_wraparound() {
        // Largest clean low half: generation 0x7F_FFFF.
        let serial = (12 << 24) | 0x00FF_FFFE;
        assert_eq!(generation(serial), 0x7F_FFFF);

        let next = commit(mark_dirty(serial), 12);
        assert_eq!(generation(next), 0);
        assert!(!is_dirty(next));
        assert_eq!(value_len(next), 12);
        assert_ne!(next, serial);
    }

    #[test]
    fn test_toc_roundtrip_boundaries() {
        for (name_len, index) in [(1, 0), (31, 0), (1, PA_COUNT_MAX - 1), (31, PA_COUNT_MAX - 1)] {
            let toc = toc_encode(name_len, index);
            assert_eq!(toc_name_len(toc), name_len);
            assert_eq!(toc_index(toc), Some(index));
        }
    }

    #[test]
    fn test_toc_matches_byte_offset() {
        assert_eq!(toc_encode(4, 0), (4 << 24) | 1024);
        assert_eq!(toc_offset(toc_encode(4, 2)), 1024 + 256);
    }

    #[test]
    fn test_toc_index_rejects_misaligned_offsets() {
        assert_eq!(toc_index(0), None);
        assert_eq!(toc_index((3 << 24) | 1000), None);
        assert_eq!(toc_index((3 << 24) | 1025), None);
    }
}
