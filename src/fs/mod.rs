//! The `Filesystem` context: bundles the block device, the ext2 driver,
//! the device-file registry, the FIFO registry and the kernel heap so that
//! no part of the core reaches for a true global.

pub mod ext2;

use crate::config::Config;
use crate::device::{BlockDev, DeviceRegistry};
use crate::file::fifo::FifoRegistry;
use crate::memory::{Heap, Pages};
use alloc::boxed::Box;
use ext2::Ext2Fs;

/// Everything a syscall entry point needs, threaded explicitly instead of
/// reached for as a static.
pub struct Filesystem {
	pub ext2: Ext2Fs,
	pub devices: DeviceRegistry,
	pub fifos: FifoRegistry,
	pub pages: Pages,
	pub heap: Heap,
	pub config: Config,
}

impl Filesystem {
	pub fn mount(dev: Box<dyn BlockDev>, config: Config) -> crate::errno::EResult<Self> {
		Ok(Self {
			ext2: Ext2Fs::mount(dev)?,
			devices: DeviceRegistry::new(),
			fifos: FifoRegistry::new(),
			pages: Pages::new(0),
			heap: Heap::new(),
			config,
		})
	}

	pub fn format(
		dev: Box<dyn BlockDev>,
		block_count: u32,
		block_size: u32,
		blocks_per_group: u32,
		inodes_per_group: u32,
		config: Config,
	) -> crate::errno::EResult<Self> {
		Ok(Self {
			ext2: Ext2Fs::format(dev, block_count, block_size, blocks_per_group, inodes_per_group)?,
			devices: DeviceRegistry::new(),
			fifos: FifoRegistry::new(),
			pages: Pages::new(0),
			heap: Heap::new(),
			config,
		})
	}
}
