//! ext2 filesystem driver: on-disk layer (superblock/group descriptors/
//! inodes/bitmaps/block-index resolution) plus the semantic layer built on
//! top of it (path resolution, create/link/unlink/delete, read/write,
//! truncate, directory iteration).

pub mod dirent;
pub mod group_desc;
pub mod inode;
mod ondisk;
mod semantic;

use crate::device::BlockDev;
use crate::errno::{self, EResult};
use alloc::boxed::Box;
use inode::InodeRaw;
use spin::Mutex;
use superblock::SuperblockRaw;

pub mod superblock;

/// Bundles a block device with the superblock cache that is the single
/// mutable in-core copy of it.
pub struct Ext2Fs {
	pub(crate) dev: Mutex<Box<dyn BlockDev>>,
	pub(crate) sb: Mutex<SuperblockRaw>,
}

/// A decoded inode together with the number it was read under; owned by
/// whoever resolved it.
#[derive(Clone, Debug)]
pub struct Inode {
	pub number: u32,
	pub raw: InodeRaw,
}

impl Ext2Fs {
	/// Mounts an already-formatted volume by reading its superblock.
	pub fn mount(dev: Box<dyn BlockDev>) -> EResult<Self> {
		let mut fs = Self {
			dev: Mutex::new(dev),
			sb: Mutex::new(SuperblockRaw::zeroed_for_mount()),
		};
		let sb = fs.read_superblock()?;
		if sb.magic != superblock::EXT2_MAGIC {
			return Err(errno::EINVAL);
		}
		*fs.sb.get_mut() = sb;
		Ok(fs)
	}

	/// Formats a fresh volume (mkfs-style helper used by tests and by
	/// whoever provisions a new disk image).
	pub fn format(
		dev: Box<dyn BlockDev>,
		block_count: u32,
		block_size: u32,
		blocks_per_group: u32,
		inodes_per_group: u32,
	) -> EResult<Self> {
		let groups = block_count.div_ceil(blocks_per_group);
		let sb = SuperblockRaw::new(block_count, block_size, blocks_per_group, inodes_per_group, groups);
		let fs = Self {
			dev: Mutex::new(dev),
			sb: Mutex::new(sb),
		};
		fs.init_layout(groups)?;
		fs.init_root()?;
		Ok(fs)
	}

	pub fn block_size(&self) -> u32 {
		self.sb.lock().block_size()
	}

	pub fn group_count(&self) -> u32 {
		self.sb.lock().group_count()
	}

	fn group_desc_table_block(&self) -> u64 {
		self.sb.lock().first_data_block as u64 + 1
	}
}
