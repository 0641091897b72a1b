//! Word/bitmap primitives.
//!
//! These operate on a plain `[usize]` bitmap, one bit per unit, and know
//! nothing about pages, headers or payloads — that lets them be exercised
//! directly with small in-memory slices instead of real mappings.

use log::trace;

/// Bits scanned per word.
pub const WORD_BITS: usize = usize::BITS as usize;

fn word_and_bit(offset: usize) -> (usize, usize) {
    (offset / WORD_BITS, offset % WORD_BITS)
}

/// Counts the run of zero bits starting at bit `start`, capped loosely by
/// `limit` and by `bits` (the bitmap's total bit count). `limit` is a hint:
/// a whole zero word is consumed even if that overshoots `limit`.
pub fn count_zero_run(bitmap: &[usize], bits: usize, start: usize, limit: usize) -> usize {
    run(bitmap, bits, start, limit, false)
}

/// Counts the run of one bits starting at bit `start`, with the same
/// overshoot contract as [`count_zero_run`].
pub fn count_one_run(bitmap: &[usize], bits: usize, start: usize, limit: usize) -> usize {
    run(bitmap, bits, start, limit, true)
}

fn run(bitmap: &[usize], bits: usize, start: usize, limit: usize, ones: bool) -> usize {
    if start >= bits {
        return 0;
    }
    let invert = |w: usize| if ones { !w } else { w };

    let (mut word_idx, bit_idx) = word_and_bit(start);
    let mut count = 0usize;
    let mut offset = start;

    if bit_idx != 0 {
        let w = invert(bitmap[word_idx]) >> bit_idx;
        if w != 0 {
            return w.trailing_zeros() as usize;
        }
        let consumed = WORD_BITS - bit_idx;
        count += consumed;
        offset += consumed;
        word_idx += 1;
    }

    while offset < bits && count < limit {
        let w = invert(bitmap[word_idx]);
        if w != 0 {
            count += w.trailing_zeros() as usize;
            return count;
        }
        count += WORD_BITS;
        offset += WORD_BITS;
        word_idx += 1;
    }
    count
}

/// Sets bits `[start, start+length)`. `length` may be zero.
pub fn set_bits(bitmap: &mut [usize], start: usize, length: usize) {
    trace!("set_bits(start={start}, length={length})");
    edit_bits(bitmap, start, length, true);
}

/// Clears bits `[start, start+length)`. `length` may be zero.
pub fn clear_bits(bitmap: &mut [usize], start: usize, length: usize) {
    trace!("clear_bits(start={start}, length={length})");
    edit_bits(bitmap, start, length, false);
}

fn edit_bits(bitmap: &mut [usize], start: usize, mut length: usize, set: bool) {
    if length == 0 {
        return;
    }
    let (mut word_idx, bit_idx) = word_and_bit(start);

    if bit_idx != 0 {
        let room = WORD_BITS - bit_idx;
        let take = length.min(room);
        let mask = low_mask(take) << bit_idx;
        if set {
            bitmap[word_idx] |= mask;
        } else {
            bitmap[word_idx] &= !mask;
        }
        length -= take;
        word_idx += 1;
    }

    while length >= WORD_BITS {
        bitmap[word_idx] = if set { usize::MAX } else { 0 };
        length -= WORD_BITS;
        word_idx += 1;
    }

    if length > 0 {
        let mask = low_mask(length);
        if set {
            bitmap[word_idx] |= mask;
        } else {
            bitmap[word_idx] &= !mask;
        }
    }
}

fn low_mask(bits: usize) -> usize {
    if bits >= WORD_BITS {
        usize::MAX
    } else {
        (1usize << bits) - 1
    }
}

/// Finds the first offset at or after `start` (inclusive of `start`) where a
/// zero run of at least `k` bits begins, scanning up to `bits` total bits.
/// Returns 0 if none is found — callers arrange for offset 0 to never be a
/// legal block start, making it a safe "not found" sentinel.
pub fn find_free_block(bitmap: &[usize], bits: usize, start: usize, k: usize) -> usize {
    let mut offset = start;
    while offset < bits {
        let length = count_zero_run(bitmap, bits, offset, k);
        if length >= k {
            trace!("find_free_block(start={start}, k={k}) -> {offset}");
            return offset;
        }
        offset += length;
        offset += count_one_run(bitmap, bits, offset, usize::MAX);
    }
    trace!("find_free_block(start={start}, k={k}) -> 0 (none)");
    0
}

/// Checks that every bit in `[start, start+length)` is set, i.e. that the
/// whole run is currently allocated. Used in debug builds to catch a
/// double-release or a wrong `units` argument before it corrupts the
/// bitmap, mirroring the C allocator's `check_units_allocated`.
pub fn all_set(bitmap: &[usize], start: usize, length: usize) -> bool {
    count_one_run(bitmap, start + length, start, length) >= length
}

/// Finds the length of the longest run of zero bits in `[start, bits)`.
pub fn find_longest_free_block(bitmap: &[usize], bits: usize, start: usize) -> usize {
    let mut offset = start;
    let mut remaining = bits - start;
    let mut longest = 0usize;
    while remaining > 0 {
        let length = count_zero_run(bitmap, bits, offset, remaining);
        longest = longest.max(length);
        offset += length;
        remaining = remaining.saturating_sub(length);

        let length = count_one_run(bitmap, bits, offset, remaining);
        offset += length;
        remaining = remaining.saturating_sub(length);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(bits: usize) -> Vec<usize> {
        vec![0usize; bits.div_ceil(WORD_BITS)]
    }

    #[test]
    fn zero_run_on_empty_bitmap() {
        let bm = words(256);
        assert_eq!(count_zero_run(&bm, 256, 0, 256), 256);
        assert_eq!(count_zero_run(&bm, 256, 64, 256), 192);
    }

    #[test]
    fn set_and_count_runs() {
        let mut bm = words(256);
        set_bits(&mut bm, 10, 20);
        assert_eq!(count_zero_run(&bm, 256, 0, 256), 10);
        assert_eq!(count_one_run(&bm, 256, 10, 256), 20);
        assert_eq!(count_zero_run(&bm, 256, 30, 256), 226);
    }

    #[test]
    fn set_spans_word_boundary() {
        let mut bm = words(256);
        set_bits(&mut bm, 60, 10); // spans bit 64
        for i in 60..70 {
            assert_eq!(count_one_run(&bm, 256, i, 1), 70 - i);
        }
        assert_eq!(count_zero_run(&bm, 256, 0, 256), 60);
    }

    #[test]
    fn clear_bits_round_trip() {
        let mut bm = words(256);
        set_bits(&mut bm, 0, 256);
        clear_bits(&mut bm, 16, 32);
        assert_eq!(count_zero_run(&bm, 256, 16, 256), 32);
        assert_eq!(count_one_run(&bm, 256, 0, 256), 16);
    }

    #[test]
    fn zero_length_edit_is_noop() {
        let mut bm = words(256);
        set_bits(&mut bm, 5, 0);
        clear_bits(&mut bm, 5, 0);
        assert_eq!(bm, words(256));
    }

    #[test]
    fn find_free_block_skips_allocated_runs() {
        let mut bm = words(256);
        set_bits(&mut bm, 0, 20); // prefix reserved, like header+bitmap
        set_bits(&mut bm, 20, 10); // first live block
        let offset = find_free_block(&bm, 256, 20, 5);
        assert_eq!(offset, 30);
    }

    #[test]
    fn find_free_block_returns_zero_when_full() {
        let mut bm = words(64);
        set_bits(&mut bm, 0, 64);
        assert_eq!(find_free_block(&bm, 64, 0, 1), 0);
    }

    #[test]
    fn longest_free_block_picks_the_biggest_gap() {
        let mut bm = words(256);
        set_bits(&mut bm, 0, 20);
        set_bits(&mut bm, 25, 5);
        set_bits(&mut bm, 100, 1);
        // gaps: [20,25)=5, [30,100)=70, [101,256)=155
        assert_eq!(find_longest_free_block(&bm, 256, 20), 155);
    }

    #[test]
    fn longest_free_block_all_free() {
        let bm = words(256);
        assert_eq!(find_longest_free_block(&bm, 256, 0), 256);
    }

    #[test]
    fn all_set_detects_partially_cleared_runs() {
        let mut bm = words(256);
        set_bits(&mut bm, 10, 20);
        assert!(all_set(&bm, 10, 20));
        assert!(!all_set(&bm, 5, 20));
        clear_bits(&mut bm, 15, 1);
        assert!(!all_set(&bm, 10, 20));
    }
}
