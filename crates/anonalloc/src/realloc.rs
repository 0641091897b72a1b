//! The reallocation decision table, crossing the sub-allocator tier and the
//! direct-mapped tier:
//!
//! | old \ new      | sub-allocated            | direct               |
//! |----------------|--------------------------|-----------------------|
//! | sub-allocated  | shrink / grow-in-place / relocate | relocate to a fresh direct mapping |
//! | direct         | relocate to a fresh sub-allocated block | `mremap`, possibly moving |
//!
//! `clean` requests that any bytes newly exposed by a grow read as zero;
//! the returned `moved` flag tells the caller whether the block's address
//! changed, so containers know when derived pointers need invalidating.

use std::ptr::NonNull;

use crate::direct::DirectAllocator;
use crate::sub_alloc::SubAllocator;
use crate::units::{bytes_to_units, PageLayout, UNIT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    SubAllocated,
    Direct,
}

fn tier_of(units: usize) -> Tier {
    if units <= PageLayout::get().max_data_units {
        Tier::SubAllocated
    } else {
        Tier::Direct
    }
}

/// Zeroes bytes `[old_size, new_size)` at `ptr` when `clean` is set and the
/// range is non-empty. A no-op on shrink or same-size calls.
fn cleanse_tail(ptr: NonNull<u8>, old_size: usize, new_size: usize, clean: bool) {
    if clean && new_size > old_size {
        anonalloc_sys::cleanse(ptr, old_size, new_size);
    }
}

/// Resizes the block at `ptr` from `old_size` to `new_size` bytes,
/// preserving its contents up to the shorter of the two lengths, and
/// returns the (possibly unchanged) pointer plus whether it moved.
///
/// `new_size = 0` is a programmer error (use `release` instead) and aborts
/// rather than silently allocating a 1-unit block.
pub(crate) fn reallocate(
    sub: &SubAllocator,
    direct: &DirectAllocator,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    clean: bool,
) -> Result<(NonNull<u8>, bool), anonalloc_sys::PageError> {
    assert_ne!(new_size, 0, "reallocate with new_size = 0 is a programmer error; call release instead");
    if old_size == new_size {
        return Ok((ptr, false));
    }

    let old_units = bytes_to_units(old_size);
    let new_units = bytes_to_units(new_size);

    match (tier_of(old_units), tier_of(new_units)) {
        (Tier::SubAllocated, Tier::SubAllocated) => {
            if new_units == old_units {
                cleanse_tail(ptr, old_size, new_size, clean);
                Ok((ptr, false))
            } else if new_units < old_units {
                sub.shrink(ptr, old_units, new_units);
                Ok((ptr, false))
            } else if sub.try_grow_in_place(ptr, old_units, new_units) {
                cleanse_tail(ptr, old_size, new_size, clean);
                Ok((ptr, false))
            } else {
                let fresh = sub.alloc(new_units, false)?;
                copy_then_release(ptr, fresh, old_units, new_units, |p, u| sub.release(p, u));
                cleanse_tail(fresh, old_size, new_size, clean);
                Ok((fresh, true))
            }
        }
        (Tier::SubAllocated, Tier::Direct) => {
            let fresh = direct.alloc(new_units, false)?;
            copy_then_release(ptr, fresh, old_units, new_units, |p, u| sub.release(p, u));
            cleanse_tail(fresh, old_size, new_size, clean);
            Ok((fresh, true))
        }
        (Tier::Direct, Tier::SubAllocated) => {
            let fresh = sub.alloc(new_units, false)?;
            copy_then_release(ptr, fresh, old_units, new_units, |p, u| direct.release(p, u));
            Ok((fresh, true))
        }
        (Tier::Direct, Tier::Direct) => {
            let new_ptr = direct.resize(ptr, old_units, new_units)?;
            let moved = new_ptr != ptr;
            cleanse_tail(new_ptr, old_size, new_size, clean);
            Ok((new_ptr, moved))
        }
    }
}

/// Copies the overlap between an `old_units`-unit source and a
/// `new_units`-unit destination, then releases the source with
/// `release_old` (which knows which tier, and therefore which release
/// routine, the source pointer belongs to).
fn copy_then_release(
    old_ptr: NonNull<u8>,
    new_ptr: NonNull<u8>,
    old_units: usize,
    new_units: usize,
    release_old: impl FnOnce(NonNull<u8>, usize),
) {
    let copy_units = old_units.min(new_units);
    // SAFETY: `old_ptr` and `new_ptr` are distinct, live allocations each
    // at least `copy_units` units long.
    unsafe {
        std::ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), copy_units * UNIT_SIZE);
    }
    release_old(old_ptr, old_units);
}
