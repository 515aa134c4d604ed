//! The two-tier buddy allocator the rest of the core runs on: a page-frame
//! allocator (`pages`) at 64 KiB–1 GiB granularity, and a small-object heap
//! (`heap`) at 32 B–64 KiB granularity layered on top of it.

pub mod heap;
pub mod pages;

pub use heap::Heap;
pub use pages::Pages;
