//! Direct-mapped tier: blocks too large to fit a sub-allocator page are
//! served by dedicated, whole-page reservations. A direct block's pointer
//! is always page-aligned, since it *is* the base of its own mapping —
//! that's what lets the top-level allocator tell the two tiers apart from
//! a pointer alone as a consistency check, without needing a side table.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::units::{PageLayout, UNIT_SIZE};

pub(crate) struct DirectAllocator {
    pages_live: AtomicUsize,
}

impl DirectAllocator {
    pub(crate) fn new() -> Self {
        DirectAllocator {
            pages_live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pages_live(&self) -> usize {
        self.pages_live.load(Ordering::Relaxed)
    }

    fn size_of(units: usize) -> usize {
        anonalloc_sys::align_to_page(units * UNIT_SIZE)
    }

    pub(crate) fn alloc(&self, units: usize, clean: bool) -> Result<NonNull<u8>, anonalloc_sys::PageError> {
        let size = Self::size_of(units);
        let ptr = anonalloc_sys::reserve(size, clean)?;
        self.pages_live
            .fetch_add(size / PageLayout::get().page_size, Ordering::Relaxed);
        trace!("direct_alloc(units={units}, clean={clean}) -> {size} bytes at {ptr:p}");
        Ok(ptr)
    }

    pub(crate) fn release(&self, ptr: NonNull<u8>, units: usize) {
        let size = Self::size_of(units);
        anonalloc_sys::unreserve(ptr, size);
        self.pages_live
            .fetch_sub(size / PageLayout::get().page_size, Ordering::Relaxed);
    }

    /// Resizes a direct block, letting the kernel relocate it if it cannot
    /// grow in place.
    pub(crate) fn resize(
        &self,
        ptr: NonNull<u8>,
        old_units: usize,
        new_units: usize,
    ) -> Result<NonNull<u8>, anonalloc_sys::PageError> {
        let old_size = Self::size_of(old_units);
        let new_size = Self::size_of(new_units);
        if old_size == new_size {
            return Ok(ptr);
        }
        let page_size = PageLayout::get().page_size;
        let new_ptr = anonalloc_sys::resize(ptr, old_size, new_size, true)?;
        let old_pages = old_size / page_size;
        let new_pages = new_size / page_size;
        if new_pages > old_pages {
            self.pages_live.fetch_add(new_pages - old_pages, Ordering::Relaxed);
        } else {
            self.pages_live.fetch_sub(old_pages - new_pages, Ordering::Relaxed);
        }
        Ok(new_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_tracked() {
        let direct = DirectAllocator::new();
        let layout = PageLayout::get();
        let units = layout.max_data_units + 1;
        let ptr = direct.alloc(units, false).unwrap();
        assert_eq!(ptr.as_ptr() as usize % layout.page_size, 0);
        assert!(direct.pages_live() >= 1);
        direct.release(ptr, units);
        assert_eq!(direct.pages_live(), 0);
    }

    #[test]
    fn clean_alloc_zeroes_the_payload() {
        let direct = DirectAllocator::new();
        let layout = PageLayout::get();
        let units = layout.max_data_units + 1;
        let ptr = direct.alloc(units, true).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), DirectAllocator::size_of(units)) };
        assert!(slice.iter().all(|&b| b == 0));
        direct.release(ptr, units);
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let direct = DirectAllocator::new();
        let layout = PageLayout::get();
        let units = layout.max_data_units + 1;
        let ptr = direct.alloc(units, false).unwrap();
        let grown = direct.resize(ptr, units, units + layout.units_per_page).unwrap();
        let shrunk = direct.resize(grown, units + layout.units_per_page, units).unwrap();
        direct.release(shrunk, units);
    }
}
