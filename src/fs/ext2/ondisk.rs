//! The on-disk layer's methods on [`super::Ext2Fs`]: superblock/group
//! descriptor fan-out, inode R/W, block-id resolution, bitmap alloc/free.

use super::group_desc::GroupDesc;
use super::inode::{self, BlockPath, InodeRaw, INVALID_BLOCK};
use super::superblock::{SuperblockRaw, SUPERBLOCK_OFFSET};
use super::{Ext2Fs, Inode};
use crate::device::{DevGuard, Whence};
use crate::errno::{self, EResult};
use alloc::vec;
use alloc::vec::Vec;

impl Ext2Fs {
	pub(crate) fn read_superblock(&mut self) -> EResult<SuperblockRaw> {
		let mut buf = [0u8; core::mem::size_of::<SuperblockRaw>()];
		let dev = self.dev.get_mut();
		let mut g = DevGuard::new(&mut **dev);
		g.read_at(SUPERBLOCK_OFFSET, &mut buf)?;
		Ok(*bytemuck::from_bytes(&buf))
	}

	/// Rewrites the primary superblock, then every sparse-super backup with
	/// `block_group_nr` temporarily set to that group and restored on exit.
	pub(crate) fn write_superblock(&self) -> EResult<()> {
		let groups = self.group_count();
		let block_size = self.block_size() as u64;
		let mut sb = *self.sb.lock();
		let saved_group_nr = sb.block_group_nr;
		let mut dev = self.dev.lock();
		let mut g = DevGuard::new(&mut **dev);

		sb.block_group_nr = 0;
		g.write_at(SUPERBLOCK_OFFSET, bytemuck::bytes_of(&sb))?;

		for group in 1..groups {
			if SuperblockRaw::is_backup_group(group) {
				sb.block_group_nr = group as u16;
				let offset = group as u64 * self.sb.lock().blocks_per_group as u64 * block_size
					+ SUPERBLOCK_OFFSET;
				g.write_at(offset, bytemuck::bytes_of(&sb))?;
			}
		}
		sb.block_group_nr = saved_group_nr;
		Ok(())
	}

	fn group_desc_offset(&self, g: u32) -> u64 {
		self.group_desc_table_block() * self.block_size() as u64
			+ g as u64 * core::mem::size_of::<GroupDesc>() as u64
	}

	pub fn get_group(&self, g: u32) -> EResult<GroupDesc> {
		let mut buf = [0u8; core::mem::size_of::<GroupDesc>()];
		let offset = self.group_desc_offset(g);
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.read_at(offset, &mut buf)?;
		Ok(*bytemuck::from_bytes(&buf))
	}

	/// Writes group descriptor `g`, fanned out to every sparse-super
	/// backup group's copy of the descriptor table.
	pub fn set_group(&self, g: u32, desc: &GroupDesc) -> EResult<()> {
		let groups = self.group_count();
		let block_size = self.block_size() as u64;
		let blocks_per_group = self.sb.lock().blocks_per_group as u64;
		let table_block = self.group_desc_table_block();
		let bytes = bytemuck::bytes_of(desc);
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);

		let primary_offset = table_block * block_size + g as u64 * bytes.len() as u64;
		guard.write_at(primary_offset, bytes)?;

		for backup_group in 1..groups {
			if SuperblockRaw::is_backup_group(backup_group) {
				let backup_table_block = backup_group * blocks_per_group as u32 + table_block as u32;
				let offset =
					backup_table_block as u64 * block_size + g as u64 * bytes.len() as u64;
				guard.write_at(offset, bytes)?;
			}
		}
		Ok(())
	}

	fn inode_location(&self, number: u32) -> EResult<(u64, GroupDesc)> {
		let inodes_per_group = self.sb.lock().inodes_per_group;
		let inode_size = self.sb.lock().inode_size as u64;
		let group = (number - 1) / inodes_per_group;
		let local = (number - 1) % inodes_per_group;
		let desc = self.get_group(group)?;
		let offset = desc.inode_table as u64 * self.block_size() as u64 + local as u64 * inode_size;
		Ok((offset, desc))
	}

	/// Reads inode `number`. `sb.inode_size` may exceed `sizeof(InodeRaw)`;
	/// trailing bytes beyond it are simply not read back.
	pub fn read_inode(&self, number: u32) -> EResult<Inode> {
		let (offset, _) = self.inode_location(number)?;
		let mut buf = [0u8; core::mem::size_of::<InodeRaw>()];
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.read_at(offset, &mut buf)?;
		Ok(Inode {
			number,
			raw: *bytemuck::from_bytes(&buf),
		})
	}

	/// Persists `inode` explicitly; there is no write-back cache.
	pub fn set_inode_info(&self, inode: &Inode) -> EResult<()> {
		let (offset, _) = self.inode_location(inode.number)?;
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.write_at(offset, bytemuck::bytes_of(&inode.raw))?;
		Ok(())
	}

	fn read_indirect_word(&self, block: u32, index: u32) -> EResult<u32> {
		if block == INVALID_BLOCK {
			return Ok(INVALID_BLOCK);
		}
		let offset = block as u64 * self.block_size() as u64 + index as u64 * 4;
		let mut buf = [0u8; 4];
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.read_at(offset, &mut buf)?;
		Ok(u32::from_le_bytes(buf))
	}

	fn write_indirect_word(&self, block: u32, index: u32, value: u32) -> EResult<()> {
		let offset = block as u64 * self.block_size() as u64 + index as u64 * 4;
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.write_at(offset, &value.to_le_bytes())?;
		Ok(())
	}

	/// Returns `INVALID_BLOCK` if logical block `n` has not been allocated
	/// yet.
	pub fn get_block_id(&self, inode: &InodeRaw, n: u64) -> EResult<u32> {
		match inode::resolve_block_path(n, self.block_size()).ok_or(errno::EINVAL)? {
			BlockPath::Direct(i) => Ok(inode.blocks[i]),
			BlockPath::Indirect { depth, indices } => {
				let mut block = inode.blocks[11 + depth as usize];
				for level in 0..depth {
					if block == INVALID_BLOCK {
						return Ok(INVALID_BLOCK);
					}
					block = self.read_indirect_word(block, indices[level as usize])?;
				}
				Ok(block)
			}
		}
	}

	/// Sets logical block `n` to `id`. When an indirect level is missing
	/// and `id != INVALID_BLOCK`, allocates it and percolates upward;
	/// unwinds its own allocations on failure.
	pub fn set_block_id(&self, inode: &mut InodeRaw, n: u64, id: u32) -> EResult<()> {
		match inode::resolve_block_path(n, self.block_size()).ok_or(errno::EINVAL)? {
			BlockPath::Direct(i) => {
				inode.blocks[i] = id;
				Ok(())
			}
			BlockPath::Indirect { depth, indices } => {
				self.set_block_id_indirect(inode, depth, &indices, id)
			}
		}
	}

	fn set_block_id_indirect(
		&self,
		inode: &mut InodeRaw,
		depth: u32,
		indices: &[u32; 3],
		id: u32,
	) -> EResult<()> {
		let slot = 11 + depth as usize;
		if id == INVALID_BLOCK {
			// Free direction: clear the leaf entry; if an indirect block's
			// first entry was the only reference, deallocate it too.
			let mut blocks_chain = [INVALID_BLOCK; 4];
			blocks_chain[0] = inode.blocks[slot];
			for level in 0..depth {
				if blocks_chain[level as usize] == INVALID_BLOCK {
					break;
				}
				blocks_chain[level as usize + 1] =
					self.read_indirect_word(blocks_chain[level as usize], indices[level as usize])?;
			}
			if blocks_chain[0] != INVALID_BLOCK {
				self.write_indirect_word(blocks_chain[0], indices[0], INVALID_BLOCK)?;
				if indices[0] == 0 {
					self.dealloc_block(blocks_chain[0])?;
					inode.blocks[slot] = INVALID_BLOCK;
				}
			}
			return Ok(());
		}

		// Allocate direction: walk from the root, allocating any missing
		// indirect block along the way, seeding it with the next index.
		let mut allocated: Vec<u32> = Vec::new();
		let result = self.alloc_indirect_chain(inode, slot, depth, indices, id, &mut allocated);
		if result.is_err() {
			for b in allocated {
				let _ = self.dealloc_block(b);
			}
		}
		result
	}

	fn alloc_indirect_chain(
		&self,
		inode: &mut InodeRaw,
		slot: usize,
		depth: u32,
		indices: &[u32; 3],
		id: u32,
		allocated: &mut Vec<u32>,
	) -> EResult<()> {
		if inode.blocks[slot] == INVALID_BLOCK {
			let seed = if depth == 1 { id } else { INVALID_BLOCK };
			let block = self.allocate_indirect(seed)?;
			allocated.push(block);
			inode.blocks[slot] = block;
			if depth == 1 {
				return Ok(());
			}
		}
		let mut block = inode.blocks[slot];
		for level in 0..depth - 1 {
			let mut next = self.read_indirect_word(block, indices[level as usize])?;
			if next == INVALID_BLOCK {
				let seed = if level + 2 == depth { id } else { INVALID_BLOCK };
				next = self.allocate_indirect(seed)?;
				allocated.push(next);
				self.write_indirect_word(block, indices[level as usize], next)?;
			}
			block = next;
		}
		self.write_indirect_word(block, indices[depth as usize - 1], id)
	}

	/// Allocates a fresh, zeroed indirect block and writes its single
	/// seed entry.
	fn allocate_indirect(&self, first_entry: u32) -> EResult<u32> {
		let block = self.alloc_block()?;
		let zero = vec![0u8; self.block_size() as usize];
		{
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.write_at(block as u64 * self.block_size() as u64, &zero)?;
		}
		if first_entry != INVALID_BLOCK {
			self.write_indirect_word(block, 0, first_entry)?;
		}
		Ok(block)
	}

	/// Scans group descriptors for a free inode bit, flips it, and
	/// persists the group/superblock counters.
	pub fn alloc_inode(&self, is_dir: bool) -> EResult<u32> {
		let number = self.alloc_bitmap_bit(true)?;
		if is_dir {
			let group = (number - 1) / self.sb.lock().inodes_per_group;
			let mut desc = self.get_group(group)?;
			desc.used_dirs_count += 1;
			self.set_group(group, &desc)?;
		}
		Ok(number)
	}

	pub fn dealloc_inode(&self, number: u32, was_dir: bool) -> EResult<()> {
		self.dealloc_bitmap_bit(true, number)?;
		if was_dir {
			let group = (number - 1) / self.sb.lock().inodes_per_group;
			let mut desc = self.get_group(group)?;
			desc.used_dirs_count = desc.used_dirs_count.saturating_sub(1);
			self.set_group(group, &desc)?;
		}
		Ok(())
	}

	pub fn alloc_block(&self) -> EResult<u32> {
		self.alloc_bitmap_bit(false)
	}

	pub fn dealloc_block(&self, block: u32) -> EResult<()> {
		self.dealloc_bitmap_bit(false, block)
	}

	/// Shared bitmap scan for both the inode and block bitmaps: skip
	/// groups that report zero free, find the first zero bit a word at a
	/// time, flip it, and persist.
	fn alloc_bitmap_bit(&self, for_inode: bool) -> EResult<u32> {
		let groups = self.group_count();
		let block_size = self.block_size();
		for group in 0..groups {
			let mut desc = self.get_group(group)?;
			let free = if for_inode { desc.free_inodes } else { desc.free_blocks };
			if free == 0 {
				continue;
			}
			let bitmap_block = if for_inode { desc.inode_bitmap } else { desc.block_bitmap };
			let mut bitmap = vec![0u8; block_size as usize];
			{
				let mut dev = self.dev.lock();
				let mut guard = DevGuard::new(&mut **dev);
				guard.read_at(bitmap_block as u64 * block_size as u64, &mut bitmap)?;
			}
			if let Some(bit) = first_zero_bit(&bitmap) {
				set_bit(&mut bitmap, bit);
				{
					let mut dev = self.dev.lock();
					let mut guard = DevGuard::new(&mut **dev);
					guard.write_at(bitmap_block as u64 * block_size as u64, &bitmap)?;
				}
				if for_inode {
					desc.free_inodes -= 1;
				} else {
					desc.free_blocks -= 1;
				}
				self.set_group(group, &desc)?;
				{
					let mut sb = self.sb.lock();
					if for_inode {
						sb.free_inode_count -= 1;
					} else {
						sb.free_block_count -= 1;
					}
				}
				self.write_superblock()?;
				let per_group = if for_inode {
					self.sb.lock().inodes_per_group
				} else {
					self.sb.lock().blocks_per_group
				};
				let base = if for_inode { 1 } else { self.sb.lock().first_data_block };
				return Ok(group * per_group + bit as u32 + base);
			}
		}
		Err(errno::ENOSPC)
	}

	fn dealloc_bitmap_bit(&self, for_inode: bool, number: u32) -> EResult<()> {
		let per_group = if for_inode {
			self.sb.lock().inodes_per_group
		} else {
			self.sb.lock().blocks_per_group
		};
		let base = if for_inode { 1 } else { self.sb.lock().first_data_block };
		let local = (number - base) % per_group;
		let group = (number - base) / per_group;
		let mut desc = self.get_group(group)?;
		let bitmap_block = if for_inode { desc.inode_bitmap } else { desc.block_bitmap };
		let block_size = self.block_size();
		let mut bitmap = vec![0u8; block_size as usize];
		{
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.read_at(bitmap_block as u64 * block_size as u64, &mut bitmap)?;
		}
		clear_bit(&mut bitmap, local as usize);
		{
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.write_at(bitmap_block as u64 * block_size as u64, &bitmap)?;
		}
		if for_inode {
			desc.free_inodes += 1;
		} else {
			desc.free_blocks += 1;
		}
		self.set_group(group, &desc)?;
		{
			let mut sb = self.sb.lock();
			if for_inode {
				sb.free_inode_count += 1;
			} else {
				sb.free_block_count += 1;
			}
		}
		self.write_superblock()
	}

	/// Lays out the group descriptor table, bitmaps and inode tables for a
	/// freshly formatted volume, needed by any test or caller that wants a
	/// volume to mount.
	pub(crate) fn init_layout(&self, groups: u32) -> EResult<()> {
		let block_size = self.block_size();
		let (blocks_per_group, inodes_per_group, first_data_block) = {
			let sb = self.sb.lock();
			(sb.blocks_per_group, sb.inodes_per_group, sb.first_data_block)
		};
		let table_block = first_data_block + 1;
		let desc_table_blocks = (groups as u64 * core::mem::size_of::<GroupDesc>() as u64)
			.div_ceil(block_size as u64) as u32;
		let inode_table_blocks_per_group =
			(inodes_per_group as u64 * core::mem::size_of::<InodeRaw>() as u64)
				.div_ceil(block_size as u64) as u32;

		let mut next_block = table_block + desc_table_blocks;
		for group in 0..groups {
			let block_bitmap = next_block;
			let inode_bitmap = next_block + 1;
			let inode_table = next_block + 2;
			next_block = inode_table + inode_table_blocks_per_group;

			let desc = GroupDesc {
				block_bitmap,
				inode_bitmap,
				inode_table,
				free_blocks: blocks_per_group as u16,
				free_inodes: inodes_per_group as u16,
				used_dirs_count: 0,
				pad: 0,
				reserved: [0; 12],
			};
			self.set_group(group, &desc)?;

			let zero = vec![0u8; block_size as usize];
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.write_at(block_bitmap as u64 * block_size as u64, &zero)?;
			guard.write_at(inode_bitmap as u64 * block_size as u64, &zero)?;
			for b in 0..inode_table_blocks_per_group {
				guard.write_at((inode_table + b) as u64 * block_size as u64, &zero)?;
			}
		}
		{
			let mut sb = self.sb.lock();
			sb.free_block_count = sb.block_count - next_block;
			sb.free_inode_count = sb.inode_count - 11; // reserve inodes 1..=11
		}
		// Reserve inode bits 1..=11 (inode 2 is the root, written by the
		// caller right after this returns) and mark blocks below
		// `next_block` used via the group's bitmap.
		for group in 0..groups {
			let mut desc = self.get_group(group)?;
			let mut ibitmap = vec![0u8; block_size as usize];
			{
				let mut dev = self.dev.lock();
				let mut guard = DevGuard::new(&mut **dev);
				guard.read_at(desc.inode_bitmap as u64 * block_size as u64, &mut ibitmap)?;
			}
			if group == 0 {
				for bit in 0..11usize {
					set_bit(&mut ibitmap, bit);
				}
				desc.free_inodes -= 11;
			}
			{
				let mut dev = self.dev.lock();
				let mut guard = DevGuard::new(&mut **dev);
				guard.write_at(desc.inode_bitmap as u64 * block_size as u64, &ibitmap)?;
			}
			self.set_group(group, &desc)?;
		}
		self.write_superblock()
	}
}

fn first_zero_bit(bitmap: &[u8]) -> Option<usize> {
	for (i, word) in bitmap.chunks(8).enumerate() {
		let mut w = [0u8; 8];
		w[..word.len()].copy_from_slice(word);
		let value = u64::from_le_bytes(w);
		if value != u64::MAX {
			let bit = value.trailing_ones() as usize;
			if i * 64 + bit < bitmap.len() * 8 {
				return Some(i * 64 + bit);
			}
		}
	}
	None
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
	bitmap[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8], bit: usize) {
	bitmap[bit / 8] &= !(1 << (bit % 8));
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::ramdisk::RamDisk;
	use alloc::boxed::Box;

	fn multi_group_fs() -> Ext2Fs {
		let disk = RamDisk::new(1024 * 1024);
		Ext2Fs::format(Box::new(disk), 256, 1024, 64, 32).unwrap()
	}

	#[test]
	fn block_allocation_from_a_later_group_returns_the_correct_absolute_id() {
		let fs = multi_group_fs();
		assert!(fs.group_count() >= 2);

		let mut desc = fs.get_group(0).unwrap();
		desc.free_blocks = 0;
		fs.set_group(0, &desc).unwrap();

		let block = fs.alloc_block().unwrap();
		let (first_data_block, blocks_per_group) = {
			let sb = fs.sb.lock();
			(sb.first_data_block, sb.blocks_per_group)
		};
		assert_eq!(block, first_data_block + blocks_per_group);
	}
}
