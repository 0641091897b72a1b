//! The page handoff protocol: a one-slot LRU cache backed by a superblock
//! of list heads indexed by longest-free-block (LFB) length.
//!
//! Bitmap mutation happens outside this module's lock, once a page has been
//! exclusively handed to a thread via [`Superblock::acquire_page`]. The lock
//! only ever protects list-head bookkeeping, never bitmap scanning or
//! editing, so the critical section stays short regardless of page size.

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::list::{add_to_list, delete_from_list};
use crate::page::{BmPage, SlotId};
use crate::units::PageLayout;

struct Inner {
    /// `slots[k]` holds pages whose longest free run is exactly `k` units,
    /// for `k` in `1..=max_data_units`. Index 0 is never populated: a page
    /// with no free units has nothing left to offer and is never listed.
    slots: Vec<Option<BmPage>>,
    lru: Option<BmPage>,
}

/// Owns every data page not currently held exclusively by some thread.
pub(crate) struct Superblock {
    inner: Mutex<Inner>,
    pages_live: AtomicUsize,
}

impl Superblock {
    pub(crate) fn new() -> Self {
        let layout = PageLayout::get();
        Superblock {
            inner: Mutex::new(Inner {
                slots: vec![None; layout.max_data_units + 1],
                lru: None,
            }),
            pages_live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pages_live(&self) -> usize {
        self.pages_live.load(Ordering::Relaxed)
    }

    /// Returns a page with a free run of at least `k` units, creating one if
    /// none of the parked pages can satisfy the request. The caller owns
    /// the page exclusively until it calls [`Superblock::unhand_page`].
    pub(crate) fn acquire_page(&self, k: usize) -> Result<BmPage, anonalloc_sys::PageError> {
        if let Some(page) = self.grab_page(k) {
            return Ok(page);
        }
        let page = BmPage::create()?;
        self.pages_live.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Finds and unlists a parked page with a free run of at least `k`
    /// units, checking the LRU slot first since it holds the page most
    /// recently touched.
    fn grab_page(&self, k: usize) -> Option<BmPage> {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.lru {
            if page.longest_free_run() >= k {
                delete_from_list(&mut inner.lru, page);
                return Some(page);
            }
        }
        for slot in k..inner.slots.len() {
            if let Some(page) = inner.slots[slot] {
                delete_from_list(&mut inner.slots[slot], page);
                return Some(page);
            }
        }
        None
    }

    /// Takes exclusive ownership of a page the caller already has a pointer
    /// to (for release/shrink/grow, as opposed to [`Superblock::acquire_page`]'s
    /// "any page with room" search). If another thread currently owns the
    /// page, spins with a yield between attempts until it is returned.
    pub(crate) fn grab_specific(&self, page: BmPage) {
        loop {
            {
                let mut inner = self.inner.lock();
                match page.state() {
                    crate::page::PageState::Owned => {}
                    crate::page::PageState::Listed(SlotId::Lru) => {
                        delete_from_list(&mut inner.lru, page);
                        return;
                    }
                    crate::page::PageState::Listed(SlotId::Superblock(slot)) => {
                        delete_from_list(&mut inner.slots[slot], page);
                        return;
                    }
                }
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn destroy_page(&self, page: BmPage) {
        page.destroy();
        self.pages_live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Renders every parked page's bitmap, prefixed with where it was
    /// found, for the diagnostic dump surfaced by [`crate::Allocator::dump`].
    pub(crate) fn dump(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for page in crate::list::iter(inner.lru) {
            out.push(format!("[lru] {}", crate::dump::dump_page(page)));
        }
        for (slot, head) in inner.slots.iter().enumerate() {
            for page in crate::list::iter(*head) {
                out.push(format!("[slot {slot}] {}", crate::dump::dump_page(page)));
            }
        }
        out
    }

    /// Returns `page` to the superblock, filing it by its current LFB and
    /// promoting it to the LRU slot. Whatever page the LRU slot previously
    /// held is re-filed into the ordinary slot array, unless it turned out
    /// to be entirely free, in which case its mapping is released — at most
    /// one page is reclaimed per call, so a burst of frees doesn't stall on
    /// unmapping every page it touches.
    pub(crate) fn unhand_page(&self, page: BmPage) {
        let layout = PageLayout::get();
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.lru {
            delete_from_list(&mut inner.lru, prev);
            let prev_lfb = prev.longest_free_run();
            if prev_lfb == layout.max_data_units {
                prev.destroy();
                self.pages_live.fetch_sub(1, Ordering::Relaxed);
            } else {
                add_to_list(&mut inner.slots[prev_lfb], SlotId::Superblock(prev_lfb), prev);
            }
        }
        add_to_list(&mut inner.lru, SlotId::Lru, page);
    }
}

// SAFETY: all mutable state lives behind `inner`'s mutex; the atomic
// counter is independently safe for concurrent access.
unsafe impl Send for Superblock {}
unsafe impl Sync for Superblock {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::set_bits;

    fn mark_used(page: BmPage, start: usize, len: usize) {
        set_bits(page.bitmap_mut(), start, len);
    }

    #[test]
    fn acquire_creates_then_reuses_via_lru() {
        let sb = Superblock::new();
        let layout = PageLayout::get();
        let page = sb.acquire_page(4).unwrap();
        assert_eq!(sb.pages_live(), 1);
        mark_used(page, layout.header_units, 4);
        sb.unhand_page(page);

        let again = sb.acquire_page(4).unwrap();
        assert_eq!(again, page, "freshly unhanded page should be served via the LRU slot");
        assert_eq!(sb.pages_live(), 1, "no new page should have been created");
        sb.unhand_page(again);
    }

    #[test]
    fn lru_eviction_files_previous_occupant_into_its_slot() {
        let sb = Superblock::new();
        let layout = PageLayout::get();

        let a = sb.acquire_page(4).unwrap();
        mark_used(a, layout.header_units, layout.max_data_units - 10);
        sb.unhand_page(a); // a becomes the LRU occupant, LFB == 10

        let b = sb.acquire_page(4).unwrap();
        assert_eq!(sb.pages_live(), 2);
        mark_used(b, layout.header_units, layout.max_data_units - 3);
        sb.unhand_page(b); // b evicts a from LRU; a should land in slots[10]

        let found = sb.acquire_page(10).unwrap();
        assert_eq!(found, a, "evicted page must still be reachable via the slot array");
    }

    #[test]
    fn fully_empty_lru_occupant_is_reclaimed_on_eviction() {
        let sb = Superblock::new();
        let a = sb.acquire_page(4).unwrap();
        sb.unhand_page(a); // fully empty, parked in LRU

        let b = sb.acquire_page(4).unwrap();
        assert_eq!(sb.pages_live(), 2);
        sb.unhand_page(b); // evicts a; a is fully empty so it is reclaimed

        assert_eq!(sb.pages_live(), 1);
    }
}
