//! The top-level allocator facade: routes requests to the sub-allocator or
//! direct-mapped tier, drives reallocation, and reports usage.

use std::ptr::NonNull;

use log::{info, trace};

use crate::direct::DirectAllocator;
use crate::realloc;
use crate::stats::{Counters, Stats};
use crate::sub_alloc::SubAllocator;
use crate::units::{bytes_to_units, PageLayout};

/// Allocator-wide knobs, analogous to a logging/verbosity config struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Emit a `log::trace!` line for every allocate/release/reallocate call,
    /// including the computed unit count and tier.
    pub trace: bool,
    /// Emit a coarser `log::info!` line for the same calls, without the
    /// unit-level detail `trace` includes.
    pub verbose: bool,
}

/// A general-purpose dynamic memory allocator over anonymous pages.
///
/// Requests of up to one page's worth of data units are served out of
/// shared, bitmap-tracked pages; larger requests get their own dedicated
/// mapping. An instance owns its pages independently of any other
/// instance and of the process's global allocator — it is a library, not
/// a `#[global_allocator]` replacement.
pub struct Allocator {
    sub: SubAllocator,
    direct: DirectAllocator,
    counters: Counters,
    config: Config,
}

impl Allocator {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Allocator {
            sub: SubAllocator::new(),
            direct: DirectAllocator::new(),
            counters: Counters::new(),
            config,
        }
    }

    /// Allocates a block of at least `size` bytes. A `size` of zero is
    /// rounded up to one unit, returning a live, uniquely-owned pointer
    /// rather than a sentinel, matching the convention `malloc(0)` callers
    /// tend to rely on. When `clean` is set the whole payload reads as zero.
    pub fn allocate(&self, size: usize, clean: bool) -> Result<NonNull<u8>, anonalloc_sys::PageError> {
        let units = bytes_to_units(size.max(1));
        let ptr = if units <= PageLayout::get().max_data_units {
            self.sub.alloc(units, clean)?
        } else {
            self.direct.alloc(units, clean)?
        };
        self.counters.record_alloc();
        if self.config.trace {
            trace!("allocate(size={size}, clean={clean}) -> {ptr:p} ({units} units)");
        }
        if self.config.verbose {
            info!("allocate(size={size}) -> {ptr:p}");
        }
        Ok(ptr)
    }

    /// Releases a block previously returned by [`allocate`] or
    /// [`reallocate`]. `size` must be the block's current size; there is no
    /// per-block header to recover it from.
    pub fn release(&self, ptr: NonNull<u8>, size: usize) {
        let layout = PageLayout::get();
        let units = bytes_to_units(size.max(1));
        let is_direct = units > layout.max_data_units;
        debug_assert_eq!(
            ptr.as_ptr() as usize % layout.page_size == 0,
            is_direct,
            "pointer/tier mismatch releasing {ptr:p} with size {size}: wrong size passed, or double free"
        );
        if is_direct {
            self.direct.release(ptr, units);
        } else {
            self.sub.release(ptr, units);
        }
        self.counters.record_release();
        if self.config.trace {
            trace!("release({ptr:p}, size={size})");
        }
        if self.config.verbose {
            info!("release({ptr:p}, size={size})");
        }
    }

    /// Resizes a block in place where possible, otherwise allocates a fresh
    /// block, copies the overlap, and releases the original. Returns the
    /// (possibly unchanged) pointer and whether it moved, so callers can
    /// tell when derived pointers need invalidating. `new_size = 0` is a
    /// programmer error; call [`release`] instead. When `clean` is set,
    /// bytes `[old_size, new_size)` read as zero after a grow.
    pub fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        clean: bool,
    ) -> Result<(NonNull<u8>, bool), anonalloc_sys::PageError> {
        let (new_ptr, moved) =
            realloc::reallocate(&self.sub, &self.direct, ptr, old_size.max(1), new_size, clean)?;
        if self.config.trace {
            trace!(
                "reallocate({ptr:p}, old_size={old_size}, new_size={new_size}, clean={clean}) -> {new_ptr:p} (moved={moved})"
            );
        }
        if self.config.verbose {
            info!("reallocate({ptr:p}, old_size={old_size}, new_size={new_size}) -> {new_ptr:p}");
        }
        Ok((new_ptr, moved))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            blocks_live: self.counters.blocks_live(),
            sub_allocator_pages_live: self.sub.pages_live(),
            direct_pages_live: self.direct.pages_live(),
        }
    }

    /// A human-readable dump of every sub-allocator page's bitmap, for
    /// debugging fragmentation. Direct-mapped blocks don't have a bitmap to
    /// show; [`stats`] reports their count.
    pub fn dump(&self) -> Vec<String> {
        self.sub.dump()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}
