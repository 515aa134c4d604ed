//! On-disk superblock: 1024 bytes at absolute offset 1024,
//! the single mutable in-core cache the rest of the on-disk layer mutates
//! and re-persists after every allocation/free.

use bytemuck::{Pod, Zeroable};

/// Absolute byte offset of the superblock on any ext2 volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// `magic` field value identifying an ext2 volume.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Byte-exact superblock layout. Field order and sizes follow standard
/// ext2 revision 1; reserved padding rounds the struct to exactly 1024
/// bytes so a whole-struct read/write matches the on-disk slot.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SuperblockRaw {
	pub inode_count: u32,
	pub block_count: u32,
	pub rblock_count: u32,
	pub free_block_count: u32,
	pub free_inode_count: u32,
	pub first_data_block: u32,
	pub log_block_size: u32,
	pub log_frag_size: u32,
	pub blocks_per_group: u32,
	pub frags_per_group: u32,
	pub inodes_per_group: u32,
	pub mtime: u32,
	pub wtime: u32,
	pub lastcheck: u32,
	pub checkinterval: u32,
	pub creator_os: u32,
	pub rev_level: u32,
	pub first_ino: u32,
	pub feature_compat: u32,
	pub feature_incompat: u32,
	pub feature_ro_compat: u32,
	pub algo_bitmap: u32,
	pub mnt_count: u16,
	pub max_mnt_count: u16,
	pub magic: u16,
	pub state: u16,
	pub errors: u16,
	pub minor_rev_level: u16,
	pub def_resuid: u16,
	pub def_resgid: u16,
	pub inode_size: u16,
	pub block_group_nr: u16,
	pub uuid: [u8; 16],
	pub volume_name: [u8; 16],
	pub last_mounted: [u8; 64],
	pub reserved: [u8; 820],
}

const _: () = assert!(core::mem::size_of::<SuperblockRaw>() == 1024);

impl SuperblockRaw {
	/// Builds a fresh superblock for a volume of `block_count` blocks,
	/// `block_size` bytes each, with `inodes_per_group`/`blocks_per_group`
	/// sized by the caller (mkfs-style helper used by tests).
	pub fn new(
		block_count: u32,
		block_size: u32,
		blocks_per_group: u32,
		inodes_per_group: u32,
		groups: u32,
	) -> Self {
		let log_block_size = (block_size / 1024).trailing_zeros();
		let first_data_block = if block_size == 1024 { 1 } else { 0 };
		let inode_count = inodes_per_group * groups;
		Self {
			inode_count,
			block_count,
			rblock_count: block_count / 20,
			free_block_count: 0,
			free_inode_count: 0,
			first_data_block,
			log_block_size,
			log_frag_size: log_block_size,
			blocks_per_group,
			frags_per_group: blocks_per_group,
			inodes_per_group,
			mtime: 0,
			wtime: 0,
			lastcheck: 0,
			checkinterval: 0,
			creator_os: 0,
			rev_level: 1,
			first_ino: 12,
			feature_compat: 0,
			feature_incompat: 0,
			feature_ro_compat: 0,
			algo_bitmap: 0,
			mnt_count: 0,
			max_mnt_count: 0xFFFF,
			magic: EXT2_MAGIC,
			state: 1,
			errors: 1,
			minor_rev_level: 0,
			def_resuid: 0,
			def_resgid: 0,
			inode_size: 128,
			block_group_nr: 0,
			uuid: [0; 16],
			volume_name: [0; 16],
			last_mounted: [0; 64],
			reserved: [0; 820],
		}
	}

	/// A placeholder value overwritten by the first read during `mount`;
	/// never itself treated as a valid superblock (`magic` is left at 0).
	pub fn zeroed_for_mount() -> Self {
		Zeroable::zeroed()
	}

	pub fn block_size(&self) -> u32 {
		1024 << self.log_block_size
	}

	pub fn group_count(&self) -> u32 {
		self.block_count.div_ceil(self.blocks_per_group)
	}

	/// Whether group `g` holds a sparse-super backup copy of the
	/// superblock and group descriptor table.
	pub fn is_backup_group(g: u32) -> bool {
		g == 1 || (g > 1 && (g % 3 == 0 || g % 5 == 0 || g % 7 == 0))
	}
}
