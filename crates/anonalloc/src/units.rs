//! Page and unit layout.
//!
//! The allocation granule `U` and the derived per-page layout (how many
//! units a page holds, how many of those units the header+bitmap occupy).

use std::sync::OnceLock;

/// Allocation granule. Every block's start offset within its page is a
/// multiple of this many bytes; must be at least `size_of::<*const ()>()`.
pub const UNIT_SIZE: usize = 16;

/// Converts a byte count to a unit count, rounding up.
#[inline]
pub fn bytes_to_units(nbytes: usize) -> usize {
    anonalloc_sys::align_up(nbytes, UNIT_SIZE) / UNIT_SIZE
}

/// Per-page layout derived from the system page size. Computed once and
/// cached, mirroring the C allocator's one-time `_init()` computation of
/// `units_per_page`/`bm_page_header_size_in_units`/`max_data_units`.
#[derive(Debug, Clone, Copy)]
pub struct PageLayout {
    /// System page size in bytes.
    pub page_size: usize,
    /// `page_size / UNIT_SIZE`.
    pub units_per_page: usize,
    /// Number of `usize` words the bitmap occupies.
    pub bitmap_words: usize,
    /// Number of leading units occupied by header + bitmap (`H`).
    pub header_units: usize,
    /// Maximum user-visible run length on a page (`M`).
    pub max_data_units: usize,
}

impl PageLayout {
    fn compute() -> Self {
        let page_size = anonalloc_sys::page_size();
        let units_per_page = page_size / UNIT_SIZE;
        assert_eq!(
            units_per_page % crate::bitmap::WORD_BITS,
            0,
            "word width must divide units-per-page evenly for this page size"
        );
        let bitmap_words = units_per_page / crate::bitmap::WORD_BITS;
        let bitmap_bytes = bitmap_words * std::mem::size_of::<usize>();
        let header_bytes = std::mem::size_of::<crate::page::PageHeader>();
        let header_units = anonalloc_sys::align_up(header_bytes + bitmap_bytes, UNIT_SIZE) / UNIT_SIZE;
        let max_data_units = units_per_page - header_units;
        Self {
            page_size,
            units_per_page,
            bitmap_words,
            header_units,
            max_data_units,
        }
    }

    /// Returns the process-wide layout, computing it on first use.
    pub fn get() -> &'static PageLayout {
        static LAYOUT: OnceLock<PageLayout> = OnceLock::new();
        LAYOUT.get_or_init(Self::compute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_self_consistent() {
        let layout = PageLayout::get();
        assert_eq!(layout.units_per_page, layout.page_size / UNIT_SIZE);
        assert_eq!(layout.header_units + layout.max_data_units, layout.units_per_page);
        assert!(layout.header_units > 0);
        assert!(layout.max_data_units > 0);
    }

    #[test]
    fn bytes_to_units_rounds_up() {
        assert_eq!(bytes_to_units(1), 1);
        assert_eq!(bytes_to_units(16), 1);
        assert_eq!(bytes_to_units(17), 2);
        assert_eq!(bytes_to_units(48), 3);
    }
}
