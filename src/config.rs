//! Configuration threaded through the [`crate::Filesystem`] context.
//!
//! A kernel at this layer has no configuration file to read; the handful of
//! knobs below are supplied by whoever constructs the context (the boot
//! sequence, or a test harness).

/// Tunables for the allocators and the ext2 layer.
#[derive(Debug, Clone, Copy)]
pub struct Config {
	/// Number of 64 KiB buddy trees pre-warmed in the heap's first slab.
	/// The heap always carries exactly 63 trees per slab (§4.3); this only
	/// hints how many slabs to pre-allocate at startup.
	pub heap_initial_slabs: usize,
	/// Whether `Ext2Fs::write`'s default entry point zero-fills a grow gap
	/// opened by `offset > file_size`. Left `false` here; the VFS layer
	/// always overrides this to `true` regardless of this setting.
	pub zero_fill_on_grow: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			heap_initial_slabs: 1,
			zero_fill_on_grow: false,
		}
	}
}
