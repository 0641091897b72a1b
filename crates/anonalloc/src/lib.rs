//! A general-purpose dynamic memory allocator for userspace POSIX
//! processes, built directly on anonymous `mmap`.
//!
//! Small and mid-sized requests are carved out of shared pages by a
//! bitmap sub-allocator; oversized requests get their own dedicated page
//! reservation. [`Allocator`] is the entry point. The external
//! collaborators — [`arena`], [`fsb_arena`], [`ring_buffer`] and
//! [`mm_array`] — build on top of the same page primitives but don't
//! depend on the sub-allocator itself.

mod allocator;
mod bitmap;
mod direct;
mod dump;
mod list;
mod page;
mod realloc;
mod stats;
mod sub_alloc;
mod superblock;
mod units;

pub mod arena;
pub mod fsb_arena;
pub mod mm_array;
pub mod ring_buffer;

pub use allocator::{Allocator, Config};
pub use stats::Stats;
pub use units::UNIT_SIZE;

pub use anonalloc_sys::PageError;
