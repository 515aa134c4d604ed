//! ext2 semantic layer on top of [`super::ondisk`]'s block/inode/bitmap
//! primitives: path resolution, `create`/`link`/`unlink`/`delete`,
//! directory packing, raw read/write and truncate.

use super::dirent::{self, DirEntryIter, DirEntryView};
use super::inode::{self, InodeRaw, INVALID_BLOCK, ROOT_INODE};
use super::{Ext2Fs, Inode};
use crate::device::DevGuard;
use crate::errno::{self, EResult};
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::Zeroable;
use core::cmp::min;

impl Ext2Fs {
	fn read_block(&self, block_id: u32) -> EResult<Vec<u8>> {
		let block_size = self.block_size();
		let mut buf = vec![0u8; block_size as usize];
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.read_at(block_id as u64 * block_size as u64, &mut buf)?;
		Ok(buf)
	}

	fn write_block(&self, block_id: u32, data: &[u8]) -> EResult<()> {
		let mut dev = self.dev.lock();
		let mut guard = DevGuard::new(&mut **dev);
		guard.write_at(block_id as u64 * self.block_size() as u64, data)?;
		Ok(())
	}

	fn logical_block_count(&self, size: u64) -> u64 {
		size.div_ceil(self.block_size() as u64)
	}

	/// Resolves a `/`-separated path starting at the root inode, stamping
	/// `atime` on success.
	pub fn lookup(&self, path: &[u8]) -> EResult<Inode> {
		let mut current = self.read_inode(ROOT_INODE)?;
		for comp in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
			let next = self
				.find_in_dir(&current.raw, comp)?
				.ok_or(errno::ENOENT)?;
			current = self.read_inode(next)?;
		}
		current.raw.atime = current.raw.atime.wrapping_add(1);
		self.set_inode_info(&current)?;
		Ok(current)
	}

	/// Resolves all but the last component of `path`, returning the parent
	/// inode and the final component (basename).
	pub fn lookup_parent<'p>(&self, path: &'p [u8]) -> EResult<(Inode, &'p [u8])> {
		let mut comps = path.split(|&b| b == b'/').filter(|c| !c.is_empty());
		let mut stack: Vec<&[u8]> = comps.by_ref().collect();
		let base = stack.pop().ok_or(errno::ENOENT)?;
		let mut current = self.read_inode(ROOT_INODE)?;
		for comp in stack {
			let next = self
				.find_in_dir(&current.raw, comp)?
				.ok_or(errno::ENOENT)?;
			current = self.read_inode(next)?;
		}
		Ok((current, base))
	}

	fn find_in_dir(&self, dir: &InodeRaw, name: &[u8]) -> EResult<Option<u32>> {
		if !dir.is_dir() {
			return Err(errno::ENOTDIR);
		}
		let blocks = self.logical_block_count(dir.size());
		for logical in 0..blocks {
			let block_id = self.get_block_id(dir, logical)?;
			if block_id == INVALID_BLOCK {
				continue;
			}
			let block = self.read_block(block_id)?;
			for entry in DirEntryIter::new(&block) {
				if !entry.is_empty_slot() && entry.name == name {
					return Ok(Some(entry.head.inode));
				}
			}
		}
		Ok(None)
	}

	fn try_link_in_block(block: &mut [u8], target: u32, file_type: u8, name: &[u8]) -> bool {
		let needed = dirent::min_rec_len(name.len());
		let head_size = 8usize;
		let mut pos = 0usize;
		while pos + head_size <= block.len() {
			let head = *bytemuck::from_bytes::<dirent::DirEntryHead>(&block[pos..pos + head_size]);
			if (head.rec_len as usize) < head_size || pos + head.rec_len as usize > block.len() {
				break;
			}
			if head.inode == 0 {
				if head.rec_len >= needed {
					dirent::write_entry(block, pos, target, head.rec_len, file_type, name);
					return true;
				}
			} else {
				let used = dirent::min_rec_len(head.name_len as usize);
				let slack = head.rec_len.saturating_sub(used);
				if slack >= needed {
					let orig_rec_len = head.rec_len;
					let mut shrunk = head;
					shrunk.rec_len = used;
					block[pos..pos + head_size].copy_from_slice(bytemuck::bytes_of(&shrunk));
					let new_offset = pos + used as usize;
					dirent::write_entry(block, new_offset, target, orig_rec_len - used, file_type, name);
					return true;
				}
			}
			pos += head.rec_len as usize;
		}
		false
	}

	/// Splices `name -> target` into `parent`'s directory blocks, reusing
	/// slack where possible and growing the directory by one block
	/// otherwise; bumps `target`'s `link_count`.
	pub fn link(&self, parent: &mut Inode, name: &[u8], target: u32, file_type: u8) -> EResult<()> {
		let block_size = self.block_size();
		let blocks = self.logical_block_count(parent.raw.size());
		for logical in 0..blocks {
			let block_id = self.get_block_id(&parent.raw, logical)?;
			if block_id == INVALID_BLOCK {
				continue;
			}
			let mut block = self.read_block(block_id)?;
			if Self::try_link_in_block(&mut block, target, file_type, name) {
				self.write_block(block_id, &block)?;
				self.bump_link_count(target, 1)?;
				return Ok(());
			}
		}

		// No slack anywhere: grow the directory by one block.
		let new_block_id = self.alloc_block()?;
		let mut block = vec![0u8; block_size as usize];
		let rec = dirent::min_rec_len(name.len());
		dirent::write_entry(&mut block, 0, target, rec, file_type, name);
		if (rec as u32) < block_size {
			dirent::write_entry(&mut block, rec as usize, 0, block_size as u16 - rec, dirent::FT_UNKNOWN, &[]);
		}
		self.write_block(new_block_id, &block)?;
		if let Err(e) = self.set_block_id(&mut parent.raw, blocks, new_block_id) {
			let _ = self.dealloc_block(new_block_id);
			return Err(e);
		}
		parent.raw.num_blocks += block_size / 512;
		parent.raw.set_size(parent.raw.size() + block_size as u64);
		self.set_inode_info(parent)?;
		self.bump_link_count(target, 1)?;
		Ok(())
	}

	/// Removes `name` from `parent`. If it was the only occupied entry in
	/// its block, the block itself is freed.
	pub fn unlink(&self, parent: &mut Inode, name: &[u8]) -> EResult<()> {
		let blocks = self.logical_block_count(parent.raw.size());
		for logical in 0..blocks {
			let block_id = self.get_block_id(&parent.raw, logical)?;
			if block_id == INVALID_BLOCK {
				continue;
			}
			let mut block = self.read_block(block_id)?;
			let entries: Vec<DirEntryView> = DirEntryIter::new(&block).collect();
			let Some(target_entry) = entries
				.iter()
				.find(|e| !e.is_empty_slot() && e.name == name)
			else {
				continue;
			};
			let target_inode = target_entry.head.inode;
			let target_offset = target_entry.offset;
			let others_empty = entries
				.iter()
				.all(|e| e.offset == target_offset || e.is_empty_slot());

			if others_empty {
				self.set_block_id(&mut parent.raw, logical, INVALID_BLOCK)?;
				self.dealloc_block(block_id)?;
				parent.raw.num_blocks = parent.raw.num_blocks.saturating_sub(self.block_size() / 512);
			} else {
				dirent::erase_entry_keep_rec_len(&mut block, target_offset);
				self.write_block(block_id, &block)?;
			}
			self.bump_link_count(target_inode, -1)?;
			parent.raw.mtime = parent.raw.mtime.wrapping_add(1);
			self.set_inode_info(parent)?;
			return Ok(());
		}
		Err(errno::ENOENT)
	}

	fn bump_link_count(&self, inum: u32, delta: i32) -> EResult<()> {
		let mut inode = self.read_inode(inum)?;
		inode.raw.link_count = (inode.raw.link_count as i32 + delta).max(0) as u16;
		self.set_inode_info(&inode)
	}

	/// Writes a brand new directory's `.`/`..` entries into a freshly
	/// allocated first block, leaving `link_count == 1` (just the `.`
	/// self-reference; the caller's subsequent [`Self::link`] into the
	/// parent brings it to 2).
	fn init_new_directory(&self, child: &mut Inode, parent_inum: u32) -> EResult<()> {
		let block_size = self.block_size();
		let block_id = self.alloc_block()?;
		let mut block = vec![0u8; block_size as usize];
		let dot_rec_len = dirent::min_rec_len(1);
		dirent::write_entry(&mut block, 0, child.number, dot_rec_len, dirent::FT_DIR, b".");
		dirent::write_entry(
			&mut block,
			dot_rec_len as usize,
			parent_inum,
			block_size as u16 - dot_rec_len,
			dirent::FT_DIR,
			b"..",
		);
		self.write_block(block_id, &block)?;
		self.set_block_id(&mut child.raw, 0, block_id)?;
		child.raw.num_blocks += block_size / 512;
		child.raw.set_size(block_size as u64);
		self.set_inode_info(child)?;
		self.bump_link_count(child.number, 1)?;
		self.bump_link_count(parent_inum, 1)?;
		Ok(())
	}

	/// Writes the root directory's inode and its self-referential `.`/`..`
	/// entries. Called once by `Ext2Fs::format`; inode 2 is pre-reserved
	/// in the inode bitmap by `init_layout` so this only has to fill in
	/// its content.
	pub(crate) fn init_root(&self) -> EResult<()> {
		let mut raw = InodeRaw::zeroed();
		raw.mode = inode::S_IFDIR | 0o755;
		let mut root = Inode {
			number: ROOT_INODE,
			raw,
		};
		self.set_inode_info(&root)?;
		self.init_new_directory(&mut root, ROOT_INODE)
	}

	/// Allocates a fresh inode, initializes it, and links `name` into
	/// `parent`. Unwinds fully on any failure.
	pub fn create(&self, parent: &mut Inode, name: &[u8], mode: u16) -> EResult<Inode> {
		let is_dir = mode & inode::S_IFMT == inode::S_IFDIR;
		let inum = self.alloc_inode(is_dir)?;
		let mut raw = InodeRaw::zeroed();
		raw.mode = mode;
		let mut child = Inode { number: inum, raw };
		if let Err(e) = self.set_inode_info(&child) {
			let _ = self.dealloc_inode(inum, is_dir);
			return Err(e);
		}

		if is_dir {
			if let Err(e) = self.init_new_directory(&mut child, parent.number) {
				let _ = self.dealloc_inode(inum, is_dir);
				return Err(e);
			}
		}

		let file_type = dirent::file_type_for_mode(mode);
		if let Err(e) = self.link(parent, name, inum, file_type) {
			if is_dir {
				let _ = self.truncate(&mut child, 0, false);
				let _ = self.bump_link_count(parent.number, -1);
			}
			let _ = self.dealloc_inode(inum, is_dir);
			return Err(e);
		}
		self.read_inode(inum)
	}

	/// Resolves `name` to an inode and either unlinks it or, if this was
	/// its last non-self link, truncates and deallocates it too.
	pub fn delete(&self, parent: &mut Inode, name: &[u8]) -> EResult<()> {
		if name == b"." || name == b".." {
			return Err(errno::EINVAL);
		}
		let target_num = self.find_in_dir(&parent.raw, name)?.ok_or(errno::ENOENT)?;
		let mut target = self.read_inode(target_num)?;
		let self_count = if target.raw.is_dir() { 2 } else { 1 };
		if target.raw.link_count as u32 > self_count {
			self.unlink(parent, name)
		} else {
			self.truncate(&mut target, 0, true)?;
			self.unlink(parent, name)?;
			self.dealloc_inode(target_num, target.raw.is_dir())
		}
	}

	/// Fails with `ENOTEMPTY` unless the directory holds only `.`/`..`.
	pub fn rmdir(&self, parent: &mut Inode, name: &[u8]) -> EResult<()> {
		let target_num = self.find_in_dir(&parent.raw, name)?.ok_or(errno::ENOENT)?;
		let target = self.read_inode(target_num)?;
		if !target.raw.is_dir() {
			return Err(errno::ENOTDIR);
		}
		let blocks = self.logical_block_count(target.raw.size());
		for logical in 0..blocks {
			let block_id = self.get_block_id(&target.raw, logical)?;
			if block_id == INVALID_BLOCK {
				continue;
			}
			let block = self.read_block(block_id)?;
			for entry in DirEntryIter::new(&block) {
				if entry.is_empty_slot() || entry.name == b"." || entry.name == b".." {
					continue;
				}
				return Err(errno::ENOTEMPTY);
			}
		}
		self.delete(parent, name)
	}

	/// Raw byte read over 64-bit offsets; does **not** clamp to file size
	/// — the VFS layer does that.
	pub fn read(&self, inode: &InodeRaw, offset: u64, buf: &mut [u8]) -> EResult<usize> {
		let block_size = self.block_size() as u64;
		let mut total = 0;
		while total < buf.len() {
			let pos = offset + total as u64;
			let logical = pos / block_size;
			let intra = (pos % block_size) as usize;
			let block_id = self.get_block_id(inode, logical)?;
			let chunk = min(buf.len() - total, block_size as usize - intra);
			if block_id == INVALID_BLOCK {
				break;
			}
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.read_at(block_id as u64 * block_size + intra as u64, &mut buf[total..total + chunk])?;
			drop(guard);
			drop(dev);
			total += chunk;
		}
		Ok(total)
	}

	/// Raw byte write over 64-bit offsets. Extends the file (via
	/// [`Self::truncate`]) when `offset + n` exceeds currently allocated
	/// space; `fill` controls whether the gap between old and new EOF is
	/// zeroed.
	pub fn write(&self, inode: &mut Inode, offset: u64, buf: &[u8], fill: bool) -> EResult<usize> {
		let block_size = self.block_size() as u64;
		let end_pos = offset + buf.len() as u64;
		let allocated = self.logical_block_count(inode.raw.size()) * block_size;
		if end_pos > allocated {
			self.truncate(inode, end_pos, fill)?;
		}

		let mut total = 0;
		while total < buf.len() {
			let pos = offset + total as u64;
			let logical = pos / block_size;
			let intra = (pos % block_size) as usize;
			let mut block_id = self.get_block_id(&inode.raw, logical)?;
			if block_id == INVALID_BLOCK {
				block_id = self.alloc_block()?;
				self.set_block_id(&mut inode.raw, logical, block_id)?;
				inode.raw.num_blocks += (block_size / 512) as u32;
			}
			let chunk = min(buf.len() - total, block_size as usize - intra);
			let mut dev = self.dev.lock();
			let mut guard = DevGuard::new(&mut **dev);
			guard.write_at(
				block_id as u64 * block_size + intra as u64,
				&buf[total..total + chunk],
			)?;
			drop(guard);
			drop(dev);
			total += chunk;
		}
		if offset + total as u64 > inode.raw.size() {
			inode.raw.set_size(offset + total as u64);
		}
		inode.raw.mtime = inode.raw.mtime.wrapping_add(1);
		self.set_inode_info(inode)?;
		Ok(total)
	}

	/// Grows or shrinks `inode` to exactly `new_size` bytes of allocation,
	/// zero-filling the grown gap when `fill` is set. Not transactional: a
	/// failure partway clamps `new_size` to whatever was actually achieved
	/// and returns the error.
	pub fn truncate(&self, inode: &mut Inode, new_size: u64, fill: bool) -> EResult<()> {
		let block_size = self.block_size() as u64;
		let old_size = inode.raw.size();
		let have = self.logical_block_count(old_size);
		let need = self.logical_block_count(new_size);

		if new_size > old_size {
			for logical in have..need {
				let block_id = match self.alloc_block() {
					Ok(b) => b,
					Err(e) => {
						inode.raw.set_size((logical * block_size).max(old_size));
						self.set_inode_info(inode)?;
						return Err(e);
					}
				};
				if let Err(e) = self.set_block_id(&mut inode.raw, logical, block_id) {
					let _ = self.dealloc_block(block_id);
					inode.raw.set_size((logical * block_size).max(old_size));
					self.set_inode_info(inode)?;
					return Err(e);
				}
				inode.raw.num_blocks += (block_size / 512) as u32;
			}
			inode.raw.set_size(new_size);
			self.set_inode_info(inode)?;
			if fill && new_size > old_size {
				let zeros = vec![0u8; block_size as usize];
				let mut pos = old_size;
				while pos < new_size {
					let chunk = min(block_size, new_size - pos);
					self.write(inode, pos, &zeros[..chunk as usize], false)?;
					pos += chunk;
				}
			}
		} else if new_size < old_size {
			for logical in (need..have).rev() {
				let block_id = self.get_block_id(&inode.raw, logical)?;
				if block_id == INVALID_BLOCK {
					continue;
				}
				if let Err(e) = self.set_block_id(&mut inode.raw, logical, INVALID_BLOCK) {
					inode.raw.set_size(((logical + 1) * block_size).clamp(new_size, old_size));
					self.set_inode_info(inode)?;
					return Err(e);
				}
				self.dealloc_block(block_id)?;
				inode.raw.num_blocks = inode.raw.num_blocks.saturating_sub((block_size / 512) as u32);
			}
			inode.raw.set_size(new_size);
			self.set_inode_info(inode)?;
		}
		Ok(())
	}

	/// Reads one directory entry at logical `(block_index, intra_offset)`,
	/// returning the entry and the cursor to resume at, or `None` at
	/// end-of-directory.
	pub fn read_dir_entry(
		&self,
		inode: &InodeRaw,
		block_index: u64,
		intra_offset: usize,
	) -> EResult<Option<(DirEntryView, u64, usize)>> {
		let block_size = self.block_size() as usize;
		let block_id = self.get_block_id(inode, block_index)?;
		if block_id == INVALID_BLOCK {
			return Ok(None);
		}
		let block = self.read_block(block_id)?;
		let mut it = DirEntryIter::new_at(&block, intra_offset);
		match it.next() {
			Some(entry) => {
				let cursor = it.cursor();
				if cursor >= block_size {
					Ok(Some((entry, block_index + 1, 0)))
				} else {
					Ok(Some((entry, block_index, cursor)))
				}
			}
			None => {
				let next_block = block_index + 1;
				if next_block * block_size as u64 >= inode.size() {
					Ok(None)
				} else {
					self.read_dir_entry(inode, next_block, 0)
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::ramdisk::RamDisk;
	use alloc::boxed::Box;

	fn small_fs() -> Ext2Fs {
		let disk = RamDisk::new(4 * 1024 * 1024);
		Ext2Fs::format(Box::new(disk), 4096, 1024, 8192, 2048).unwrap()
	}

	#[test]
	fn create_write_read_round_trip() {
		let fs = small_fs();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		let mut file = fs.create(&mut root, b"a", inode::S_IFREG | 0o644).unwrap();
		let n = fs.write(&mut file, 0, b"hello", true).unwrap();
		assert_eq!(n, 5);
		let mut buf = [0u8; 5];
		let n = fs.read(&file.raw, 0, &mut buf).unwrap();
		assert_eq!(n, 5);
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn mkdir_lists_dot_dotdot_and_child() {
		let fs = small_fs();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		let mut dir = fs.create(&mut root, b"d", inode::S_IFDIR | 0o755).unwrap();
		fs.create(&mut dir, b"x", inode::S_IFREG | 0o644).unwrap();
		let dir = fs.read_inode(dir.number).unwrap();

		let mut names = Vec::new();
		let mut cursor = Some((0u64, 0usize));
		while let Some((bi, intra)) = cursor {
			match fs.read_dir_entry(&dir.raw, bi, intra).unwrap() {
				Some((entry, next_bi, next_intra)) => {
					if !entry.is_empty_slot() {
						names.push(entry.name.clone());
					}
					cursor = Some((next_bi, next_intra));
				}
				None => cursor = None,
			}
		}
		assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"x".to_vec()]);
	}

	#[test]
	fn rmdir_nonempty_fails_and_preserves_state() {
		let fs = small_fs();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		fs.create(&mut root, b"e", inode::S_IFDIR | 0o755).unwrap();
		let mut e = fs.lookup(b"/e").unwrap();
		fs.create(&mut e, b"f", inode::S_IFREG | 0o644).unwrap();

		let before = fs.get_group(0).unwrap();
		assert_eq!(fs.rmdir(&mut root, b"e").unwrap_err(), errno::ENOTEMPTY);
		let after = fs.get_group(0).unwrap();
		assert_eq!(before, after);
	}

	#[test]
	fn create_then_delete_restores_free_counts() {
		let fs = small_fs();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		let before = fs.get_group(0).unwrap();
		fs.create(&mut root, b"a", inode::S_IFREG | 0o644).unwrap();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		fs.delete(&mut root, b"a").unwrap();
		let after = fs.get_group(0).unwrap();
		assert_eq!(before.free_inodes, after.free_inodes);
		assert_eq!(before.free_blocks, after.free_blocks);
	}

	#[test]
	fn write_across_indirect_boundary_allocates_indirect_block() {
		let fs = small_fs();
		let mut root = fs.read_inode(ROOT_INODE).unwrap();
		let mut file = fs.create(&mut root, b"big", inode::S_IFREG | 0o644).unwrap();
		let block_size = fs.block_size() as u64;
		let data = vec![7u8; (13 * block_size) as usize];
		fs.write(&mut file, 0, &data, true).unwrap();
		let file = fs.read_inode(file.number).unwrap();
		assert_ne!(file.raw.blocks[12], INVALID_BLOCK);
		for i in 0..12 {
			assert_ne!(file.raw.blocks[i], INVALID_BLOCK);
		}
	}
}
