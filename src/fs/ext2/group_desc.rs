//! Block group descriptor: 32 bytes, packed, one per block group,
//! replicated under the same sparse-super rule as the superblock.

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Eq)]
pub struct GroupDesc {
	pub block_bitmap: u32,
	pub inode_bitmap: u32,
	pub inode_table: u32,
	pub free_blocks: u16,
	pub free_inodes: u16,
	pub used_dirs_count: u16,
	pub pad: u16,
	pub reserved: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<GroupDesc>() == 32);

impl GroupDesc {
	pub const fn zeroed_desc() -> Self {
		Self {
			block_bitmap: 0,
			inode_bitmap: 0,
			inode_table: 0,
			free_blocks: 0,
			free_inodes: 0,
			used_dirs_count: 0,
			pad: 0,
			reserved: [0; 12],
		}
	}
}
