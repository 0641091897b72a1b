//! Fixed-size-block arena.
//!
//! Unlike the bitmap sub-allocator, every block on a page is the same
//! size, so a page's bitmap only ever needs to answer "is this one block
//! free", never "how long is this run" — a plain first-zero-bit scan
//! instead of run counting. Pages move between an `avail` list (at least
//! one free block) and a `full` list as blocks come and go; one page is
//! always kept alive even when completely empty.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

#[repr(C)]
struct PageHeader {
    next: Option<NonNull<PageHeader>>,
    prev: Option<NonNull<PageHeader>>,
    free_count: usize,
}

fn list_push_front(head: &mut Option<NonNull<PageHeader>>, page: NonNull<PageHeader>) {
    unsafe {
        (*page.as_ptr()).prev = None;
        (*page.as_ptr()).next = *head;
        if let Some(old) = *head {
            (*old.as_ptr()).prev = Some(page);
        }
    }
    *head = Some(page);
}

fn list_remove(head: &mut Option<NonNull<PageHeader>>, page: NonNull<PageHeader>) {
    unsafe {
        let next = (*page.as_ptr()).next;
        let prev = (*page.as_ptr()).prev;
        match prev {
            Some(p) => (*p.as_ptr()).next = next,
            None => *head = next,
        }
        if let Some(n) = next {
            (*n.as_ptr()).prev = prev;
        }
    }
}

struct Inner {
    avail: Option<NonNull<PageHeader>>,
    full: Option<NonNull<PageHeader>>,
}

/// An arena that hands out fixed-size, fixed-alignment blocks.
pub struct FsbArena {
    block_size: usize,
    blocks_per_page: usize,
    bitmap_words: usize,
    blocks_offset: usize,
    page_size: usize,
    inner: Mutex<Inner>,
    pages_live: AtomicUsize,
}

const WORD_BITS: usize = usize::BITS as usize;

impl FsbArena {
    /// Creates an arena serving blocks of `block_size` bytes aligned to
    /// `block_alignment`, which must be a power of two. Reserves its first
    /// page immediately.
    pub fn new(block_size: usize, block_alignment: usize) -> Result<Self, anonalloc_sys::PageError> {
        let page_size = anonalloc_sys::page_size();
        let header_size = std::mem::size_of::<PageHeader>();
        let trial_blocks = (page_size - header_size) / block_size.max(1);
        let bitmap_words = trial_blocks.div_ceil(WORD_BITS).max(1);
        let blocks_offset = anonalloc_sys::align_up(
            header_size + bitmap_words * std::mem::size_of::<usize>(),
            block_alignment,
        );
        let blocks_per_page = (page_size - blocks_offset) / block_size;
        assert!(blocks_per_page > 0, "block_size too large for a single page");

        let arena = FsbArena {
            block_size,
            blocks_per_page,
            bitmap_words,
            blocks_offset,
            page_size,
            inner: Mutex::new(Inner { avail: None, full: None }),
            pages_live: AtomicUsize::new(0),
        };
        let page = arena.new_page()?;
        let mut inner = arena.inner.lock();
        list_push_front(&mut inner.avail, page);
        drop(inner);
        Ok(arena)
    }

    pub fn pages_live(&self) -> usize {
        self.pages_live.load(Ordering::Relaxed)
    }

    fn new_page(&self) -> Result<NonNull<PageHeader>, anonalloc_sys::PageError> {
        let base = anonalloc_sys::reserve(self.page_size, false)?;
        let header = base.cast::<PageHeader>();
        unsafe {
            header.as_ptr().write(PageHeader {
                next: None,
                prev: None,
                free_count: self.blocks_per_page,
            });
        }
        self.pages_live.fetch_add(1, Ordering::Relaxed);
        Ok(header)
    }

    fn bitmap(&self, page: NonNull<PageHeader>) -> &'static mut [usize] {
        let ptr = (page.as_ptr() as usize + std::mem::size_of::<PageHeader>()) as *mut usize;
        unsafe { std::slice::from_raw_parts_mut(ptr, self.bitmap_words) }
    }

    fn block_ptr(&self, page: NonNull<PageHeader>, index: usize) -> NonNull<u8> {
        let addr = page.as_ptr() as usize + self.blocks_offset + index * self.block_size;
        NonNull::new(addr as *mut u8).unwrap()
    }

    fn find_free_bit(bitmap: &[usize], limit: usize) -> Option<usize> {
        for (word_idx, word) in bitmap.iter().enumerate() {
            if *word != usize::MAX {
                let bit = (!word).trailing_zeros() as usize;
                let index = word_idx * WORD_BITS + bit;
                if index < limit {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Allocates one block, reserving a new page if every existing page is
    /// full.
    pub fn allocate(&self) -> Result<NonNull<u8>, anonalloc_sys::PageError> {
        let mut inner = self.inner.lock();
        if inner.avail.is_none() {
            drop(inner);
            let page = self.new_page()?;
            inner = self.inner.lock();
            list_push_front(&mut inner.avail, page);
        }
        let page = inner.avail.expect("just ensured avail is non-empty");
        let index = Self::find_free_bit(self.bitmap(page), self.blocks_per_page)
            .expect("a page in `avail` must have at least one free block");
        crate::bitmap::set_bits(self.bitmap(page), index, 1);
        unsafe {
            (*page.as_ptr()).free_count -= 1;
            if (*page.as_ptr()).free_count == 0 {
                list_remove(&mut inner.avail, page);
                list_push_front(&mut inner.full, page);
            }
        }
        Ok(self.block_ptr(page, index))
    }

    /// Releases a block previously returned by [`allocate`]. A page that
    /// becomes completely empty is unmapped immediately, unless it is the
    /// only page left in `avail` — one page is always kept around so the
    /// next `allocate` doesn't have to `mmap` a fresh one.
    pub fn release(&self, ptr: NonNull<u8>) {
        let page_base = anonalloc_sys::align_down(ptr.as_ptr() as usize, self.page_size);
        let page = NonNull::new(page_base as *mut PageHeader).unwrap();
        let index = (ptr.as_ptr() as usize - page_base - self.blocks_offset) / self.block_size;

        let mut inner = self.inner.lock();
        crate::bitmap::clear_bits(self.bitmap(page), index, 1);
        let now_fully_empty = unsafe {
            let was_full = (*page.as_ptr()).free_count == 0;
            (*page.as_ptr()).free_count += 1;
            if was_full {
                list_remove(&mut inner.full, page);
                list_push_front(&mut inner.avail, page);
            }
            (*page.as_ptr()).free_count == self.blocks_per_page
        };
        if !now_fully_empty {
            return;
        }
        let is_only_avail = unsafe { (*page.as_ptr()).next.is_none() && (*page.as_ptr()).prev.is_none() };
        if is_only_avail {
            return;
        }
        list_remove(&mut inner.avail, page);
        drop(inner);
        anonalloc_sys::unreserve(page.cast(), self.page_size);
        self.pages_live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Renders each page's block count and remaining free count, for
    /// debugging.
    pub fn dump(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut cursor = inner.avail;
        while let Some(page) = cursor {
            let free = unsafe { (*page.as_ptr()).free_count };
            out.push(format!("[avail] {free}/{} free", self.blocks_per_page));
            cursor = unsafe { (*page.as_ptr()).next };
        }
        let mut cursor = inner.full;
        while let Some(page) = cursor {
            out.push(format!("[full] 0/{} free", self.blocks_per_page));
            cursor = unsafe { (*page.as_ptr()).next };
        }
        out
    }
}

impl Drop for FsbArena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for head in [inner.avail, inner.full] {
            let mut cursor = head;
            while let Some(page) = cursor {
                let next = unsafe { (*page.as_ptr()).next };
                anonalloc_sys::unreserve(page.cast(), self.page_size);
                cursor = next;
            }
        }
    }
}

// SAFETY: all mutable state lives behind `inner`'s mutex; `pages_live` is
// independently atomic.
unsafe impl Send for FsbArena {}
unsafe impl Sync for FsbArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_reuses_the_block() {
        let arena = FsbArena::new(32, 8).unwrap();
        let a = arena.allocate().unwrap();
        arena.release(a);
        let b = arena.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn filling_a_page_spills_into_a_new_one() {
        let arena = FsbArena::new(64, 8).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..arena.blocks_per_page + 1 {
            ptrs.push(arena.allocate().unwrap());
        }
        assert!(arena.pages_live() >= 2);
        for p in ptrs {
            arena.release(p);
        }
    }

    #[test]
    fn sole_avail_page_is_kept_when_fully_freed() {
        let arena = FsbArena::new(32, 8).unwrap();
        let ptr = arena.allocate().unwrap();
        assert_eq!(arena.pages_live(), 1);
        arena.release(ptr);
        assert_eq!(arena.pages_live(), 1, "the only page should not be unmapped");
    }

    #[test]
    fn extra_fully_empty_page_is_reclaimed() {
        let arena = FsbArena::new(64, 8).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..arena.blocks_per_page + 1 {
            ptrs.push(arena.allocate().unwrap());
        }
        assert_eq!(arena.pages_live(), 2);
        // Release every block from the second page only.
        for p in ptrs.drain(arena.blocks_per_page..) {
            arena.release(p);
        }
        assert_eq!(arena.pages_live(), 1, "the emptied extra page should be reclaimed");
        for p in ptrs {
            arena.release(p);
        }
    }

    #[test]
    fn blocks_are_aligned() {
        let arena = FsbArena::new(24, 16).unwrap();
        let ptr = arena.allocate().unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        arena.release(ptr);
    }
}
