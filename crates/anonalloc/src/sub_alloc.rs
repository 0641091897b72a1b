//! Sub-allocator operations: carving, releasing and resizing blocks inside
//! pages drawn from a [`Superblock`].
//!
//! Every operation that touches a specific, already-allocated pointer
//! follows the same shape: grab exclusive ownership of the page the pointer
//! lives on, edit the bitmap, hand the page back. Allocation differs only
//! in that it doesn't know which page it wants yet, so it asks the
//! superblock for "any page with room" instead of a specific one.

use std::ptr::NonNull;

use log::{trace, warn};

use crate::bitmap::{all_set, clear_bits, count_zero_run, find_free_block, set_bits};
use crate::page::BmPage;
use crate::superblock::Superblock;
use crate::units::{PageLayout, UNIT_SIZE};

/// Warns, without aborting, when the units about to be released aren't all
/// currently marked allocated — a sign of a double release or a wrong
/// `units`/`old_units` argument. Debug builds only, same as the C
/// allocator's `check_units_allocated`, which only ever prints.
#[cfg(debug_assertions)]
fn check_units_allocated(bitmap: &[usize], offset: usize, units: usize, caller: &str) {
    if !all_set(bitmap, offset, units) {
        warn!("{caller}: releasing offset={offset} units={units} that aren't all allocated (double release?)");
    }
}

#[cfg(not(debug_assertions))]
fn check_units_allocated(_bitmap: &[usize], _offset: usize, _units: usize, _caller: &str) {}

pub(crate) struct SubAllocator {
    superblock: Superblock,
}

impl SubAllocator {
    pub(crate) fn new() -> Self {
        SubAllocator {
            superblock: Superblock::new(),
        }
    }

    pub(crate) fn pages_live(&self) -> usize {
        self.superblock.pages_live()
    }

    pub(crate) fn dump(&self) -> Vec<String> {
        self.superblock.dump()
    }

    /// Carves a `units`-unit block out of some page with room for it,
    /// creating a new page if none of the parked ones qualify. Zeroes the
    /// returned payload when `clean` is set.
    pub(crate) fn alloc(&self, units: usize, clean: bool) -> Result<NonNull<u8>, anonalloc_sys::PageError> {
        let layout = PageLayout::get();
        let page = self.superblock.acquire_page(units)?;
        let offset = find_free_block(page.bitmap(), layout.units_per_page, layout.header_units, units);
        debug_assert_ne!(offset, 0, "superblock handed back a page without room for {units} units");
        set_bits(page.bitmap_mut(), offset, units);
        self.superblock.unhand_page(page);
        trace!("sub_alloc(units={units}, clean={clean}) -> offset {offset}");
        let ptr = page.unit_ptr(offset);
        if clean {
            anonalloc_sys::cleanse(ptr, 0, units * UNIT_SIZE);
        }
        Ok(ptr)
    }

    /// Frees a `units`-unit block previously returned by [`alloc`].
    pub(crate) fn release(&self, ptr: NonNull<u8>, units: usize) {
        let page = BmPage::from_user_ptr(ptr);
        self.superblock.grab_specific(page);
        let offset = page.offset_of(ptr);
        check_units_allocated(page.bitmap(), offset, units, "sub_release");
        clear_bits(page.bitmap_mut(), offset, units);
        trace!("sub_release(offset={offset}, units={units})");
        self.superblock.unhand_page(page);
    }

    /// Shrinks a block in place. Always succeeds: clearing bits can never
    /// fail the way extending a run can.
    pub(crate) fn shrink(&self, ptr: NonNull<u8>, old_units: usize, new_units: usize) {
        debug_assert!(new_units < old_units);
        let page = BmPage::from_user_ptr(ptr);
        self.superblock.grab_specific(page);
        let offset = page.offset_of(ptr);
        check_units_allocated(page.bitmap(), offset + new_units, old_units - new_units, "sub_shrink");
        clear_bits(page.bitmap_mut(), offset + new_units, old_units - new_units);
        self.superblock.unhand_page(page);
    }

    /// Attempts to grow a block in place by claiming the free units
    /// immediately following it. Returns `false` (leaving the block
    /// untouched) when there isn't enough room, so the caller can fall back
    /// to relocation.
    pub(crate) fn try_grow_in_place(&self, ptr: NonNull<u8>, old_units: usize, new_units: usize) -> bool {
        debug_assert!(new_units > old_units);
        let page = BmPage::from_user_ptr(ptr);
        self.superblock.grab_specific(page);
        let offset = page.offset_of(ptr);
        let needed = new_units - old_units;
        let layout = PageLayout::get();
        let available = count_zero_run(page.bitmap(), layout.units_per_page, offset + old_units, needed);
        let grew = available >= needed;
        if grew {
            set_bits(page.bitmap_mut(), offset + old_units, needed);
        }
        self.superblock.unhand_page(page);
        grew
    }
}
