//! `FileDescriptor`: the tagged variant that composes ext2 files and
//! directories, FIFOs and device files — a tagged variant rather than a
//! struct of function pointers, since the device-file registry is the one
//! spot that genuinely needs indirect dispatch, and `DeviceRegistry`
//! already supplies that.

use super::fifo::FifoHandle;
use super::{open_flags, Stat};
use crate::device::Whence;
use crate::errno::{self, EResult};
use crate::fs::ext2::inode;
use crate::fs::Filesystem;
use alloc::vec::Vec;
use core::cmp::min;

/// One directory entry as handed back by [`FileDescriptor::read_dir`].
#[derive(Debug, Clone)]
pub struct DirentInfo {
	pub inode: u32,
	pub file_type: u8,
	pub name: Vec<u8>,
}

enum Payload {
	Regular { inode: u32, offset: u64 },
	Directory { inode: u32, block_index: u64, intra_offset: usize },
	Fifo(FifoHandle),
	Device { inode: u32, offset: u64 },
}

/// `{path, mode, payload}`. Refcounting and locking are folded into
/// ordinary Rust ownership: a descriptor is closed exactly once, by
/// whoever holds the last handle to it.
pub struct FileDescriptor {
	path: Vec<u8>,
	mode: u32,
	payload: Payload,
}

impl FileDescriptor {
	/// Resolves `path`; if missing and `CREATE` is set, creates it as a
	/// regular file first. Then dispatches, in order, to the FIFO path, the
	/// device-file registry, or a default file/directory descriptor.
	pub fn open(fs: &Filesystem, path: &[u8], mode: u32) -> EResult<Self> {
		let resolved = match fs.ext2.lookup(path) {
			Ok(found) => found,
			Err(e) if e == errno::ENOENT && mode & open_flags::CREATE != 0 => {
				let (mut parent, base) = fs.ext2.lookup_parent(path)?;
				fs.ext2.create(&mut parent, base, inode::S_IFREG | 0o644)?
			}
			Err(e) => return Err(e),
		};

		if resolved.raw.is_fifo() {
			let handle = fs.fifos.open(path, mode)?;
			return Ok(Self {
				path: path.to_vec(),
				mode,
				payload: Payload::Fifo(handle),
			});
		}

		if fs.devices.is_device(resolved.number) {
			return Ok(Self {
				path: path.to_vec(),
				mode,
				payload: Payload::Device {
					inode: resolved.number,
					offset: 0,
				},
			});
		}

		let mut desc = if resolved.raw.is_dir() {
			Self {
				path: path.to_vec(),
				mode,
				payload: Payload::Directory {
					inode: resolved.number,
					block_index: 0,
					intra_offset: 0,
				},
			}
		} else {
			Self {
				path: path.to_vec(),
				mode,
				payload: Payload::Regular {
					inode: resolved.number,
					offset: 0,
				},
			}
		};

		if mode & open_flags::TRUNCATE != 0 && mode & open_flags::WRITE != 0 {
			desc.truncate(fs, 0)?;
		}
		Ok(desc)
	}

	/// Clamps to `file_size - offset`, reads, and advances the cursor.
	pub fn read(&mut self, fs: &Filesystem, buf: &mut [u8]) -> EResult<usize> {
		if self.mode & open_flags::READ == 0 {
			return Err(errno::EACCES);
		}
		match &mut self.payload {
			Payload::Regular { inode: inum, offset } => {
				let current = fs.ext2.read_inode(*inum)?;
				let remaining = current.raw.size().saturating_sub(*offset);
				let n = min(buf.len() as u64, remaining) as usize;
				let read = fs.ext2.read(&current.raw, *offset, &mut buf[..n])?;
				*offset += read as u64;
				Ok(read)
			}
			Payload::Device { inode: inum, offset } => {
				let n = fs.devices.read(*inum, *offset, buf)?;
				*offset += n as u64;
				Ok(n)
			}
			Payload::Fifo(handle) => handle.read(buf),
			Payload::Directory { .. } => Err(errno::EISDIR),
		}
	}

	/// One directory entry; crosses block boundaries transparently and
	/// returns `None` at end-of-directory.
	pub fn read_dir(&mut self, fs: &Filesystem) -> EResult<Option<DirentInfo>> {
		let Payload::Directory { inode: inum, block_index, intra_offset } = &mut self.payload else {
			return Err(errno::ENOTDIR);
		};
		let current = fs.ext2.read_inode(*inum)?;
		match fs.ext2.read_dir_entry(&current.raw, *block_index, *intra_offset)? {
			Some((entry, next_block, next_intra)) => {
				*block_index = next_block;
				*intra_offset = next_intra;
				Ok(Some(DirentInfo {
					inode: entry.head.inode,
					file_type: entry.head.file_type,
					name: entry.name,
				}))
			}
			None => Ok(None),
		}
	}

	/// Writes are rejected for directories and unwritable descriptors;
	/// `APPEND` seeks to end-of-file first.
	pub fn write(&mut self, fs: &Filesystem, buf: &[u8]) -> EResult<usize> {
		if self.mode & open_flags::WRITE == 0 {
			return Err(errno::EACCES);
		}
		match &mut self.payload {
			Payload::Regular { inode: inum, offset } => {
				if self.mode & open_flags::APPEND != 0 {
					let current = fs.ext2.read_inode(*inum)?;
					*offset = current.raw.size();
				}
				let mut current = fs.ext2.read_inode(*inum)?;
				let written = fs.ext2.write(&mut current, *offset, buf, true)?;
				*offset += written as u64;
				Ok(written)
			}
			Payload::Device { inode: inum, offset } => {
				let n = fs.devices.write(*inum, *offset, buf)?;
				*offset += n as u64;
				Ok(n)
			}
			Payload::Fifo(handle) => {
				let mut total = 0;
				while total < buf.len() {
					total += handle.write(&buf[total..])?;
				}
				Ok(total)
			}
			Payload::Directory { .. } => Err(errno::EACCES),
		}
	}

	/// `SET`/`CUR`/`END` over files and directories; seeking a writable
	/// file past its current end extends it with zero-fill (see
	/// `DESIGN.md` for the rationale). FIFOs always fail with `ESPIPE`.
	pub fn seek(&mut self, fs: &Filesystem, offset: i64, whence: Whence) -> EResult<u64> {
		match &mut self.payload {
			Payload::Regular { inode: inum, offset: cursor } | Payload::Device { inode: inum, offset: cursor } => {
				let current = fs.ext2.read_inode(*inum)?;
				let base = match whence {
					Whence::Set => 0i64,
					Whence::Cur => *cursor as i64,
					Whence::End => current.raw.size() as i64,
				};
				let new_offset = base.checked_add(offset).ok_or(errno::EINVAL)?;
				if new_offset < 0 {
					return Err(errno::EINVAL);
				}
				let new_offset = new_offset as u64;
				if new_offset > current.raw.size() && self.mode & open_flags::WRITE != 0 {
					let mut current = current;
					fs.ext2.truncate(&mut current, new_offset, true)?;
				}
				*cursor = new_offset;
				Ok(new_offset)
			}
			Payload::Directory { inode: inum, block_index, intra_offset } => {
				match whence {
					Whence::Set => {
						*block_index = 0;
						*intra_offset = 0;
					}
					Whence::Cur if offset == 0 => {}
					Whence::Cur | Whence::End => {
						let steps = if whence == Whence::End { u64::MAX } else { offset.max(0) as u64 };
						*block_index = 0;
						*intra_offset = 0;
						let current = fs.ext2.read_inode(*inum)?;
						let mut walked = 0u64;
						while walked < steps {
							match fs.ext2.read_dir_entry(&current.raw, *block_index, *intra_offset)? {
								Some((_, next_block, next_intra)) => {
									*block_index = next_block;
									*intra_offset = next_intra;
									walked += 1;
								}
								None => break,
							}
						}
						if whence == Whence::End {
							return Ok(walked);
						}
					}
				}
				Ok(*block_index)
			}
			Payload::Fifo(_) => Err(errno::ESPIPE),
		}
	}

	/// Grows or shrinks the backing inode.
	pub fn truncate(&mut self, fs: &Filesystem, new_size: u64) -> EResult<()> {
		match &mut self.payload {
			Payload::Regular { inode: inum, .. } => {
				let mut current = fs.ext2.read_inode(*inum)?;
				fs.ext2.truncate(&mut current, new_size, true)
			}
			Payload::Directory { .. } => Err(errno::EISDIR),
			Payload::Fifo(_) => Err(errno::ESPIPE),
			Payload::Device { .. } => Ok(()),
		}
	}

	/// Resolves the backing inode (by path, for a FIFO) and fills in a
	/// `Stat`.
	pub fn stat(&self, fs: &Filesystem) -> EResult<Stat> {
		let inum = match &self.payload {
			Payload::Regular { inode, .. } | Payload::Directory { inode, .. } | Payload::Device { inode, .. } => *inode,
			Payload::Fifo(_) => fs.ext2.lookup(&self.path)?.number,
		};
		let current = fs.ext2.read_inode(inum)?;
		let block_size = fs.ext2.block_size();
		let size = current.raw.size();
		Ok(Stat {
			dev_id: 0,
			inode: inum,
			mode: current.raw.mode as u32,
			num_links: current.raw.link_count as u32,
			size,
			block_size,
			num_512_blocks: Stat::num_512_blocks_for(size),
			atime: current.raw.atime,
			ctime: current.raw.ctime,
			mtime: current.raw.mtime,
		})
	}

	/// The only request this layer understands: `FIONREAD`, on a FIFO or a
	/// regular file (bytes remaining to end-of-file from the cursor).
	pub fn ioctl(&self, fs: &Filesystem, request: u32) -> EResult<u64> {
		match (&self.payload, request) {
			(Payload::Fifo(handle), super::FIONREAD) => Ok(handle.available() as u64),
			(Payload::Regular { inode, offset }, super::FIONREAD) => {
				let current = fs.ext2.read_inode(*inode)?;
				Ok(current.raw.size().saturating_sub(*offset))
			}
			_ => Err(errno::EINVAL),
		}
	}

	pub fn can_read(&self) -> bool {
		match &self.payload {
			Payload::Fifo(handle) => !handle.is_writer() && handle.available() > 0,
			Payload::Directory { .. } => false,
			_ => self.mode & open_flags::READ != 0,
		}
	}

	pub fn can_write(&self) -> bool {
		match &self.payload {
			Payload::Directory { .. } => false,
			_ => self.mode & open_flags::WRITE != 0,
		}
	}

	/// Deep-copies the descriptor: the payload is copied by value so
	/// position and size tracking are per-handle from then on.
	pub fn duplicate(&self) -> Self {
		let payload = match &self.payload {
			Payload::Regular { inode, offset } => Payload::Regular { inode: *inode, offset: *offset },
			Payload::Directory { inode, block_index, intra_offset } => Payload::Directory {
				inode: *inode,
				block_index: *block_index,
				intra_offset: *intra_offset,
			},
			Payload::Device { inode, offset } => Payload::Device { inode: *inode, offset: *offset },
			Payload::Fifo(handle) => Payload::Fifo(handle.duplicate()),
		};
		Self {
			path: self.path.clone(),
			mode: self.mode,
			payload,
		}
	}

	/// If `DELETE_ON_CLOSE` is set, unlinks the path (directories must be
	/// empty) once this was the last handle.
	pub fn close(self, fs: &Filesystem) -> EResult<()> {
		if let Payload::Fifo(handle) = &self.payload {
			handle.close(&fs.fifos);
		}
		if self.mode & super::open_flags::DELETE_ON_CLOSE != 0 {
			let (mut parent, base) = fs.ext2.lookup_parent(&self.path)?;
			match &self.payload {
				Payload::Directory { .. } => fs.ext2.rmdir(&mut parent, base)?,
				_ => fs.ext2.delete(&mut parent, base)?,
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::device::ramdisk::RamDisk;
	use alloc::boxed::Box;

	fn small_fs() -> Filesystem {
		let disk = RamDisk::new(4 * 1024 * 1024);
		Filesystem::format(Box::new(disk), 4096, 1024, 8192, 2048, Config::default()).unwrap()
	}

	#[test]
	fn create_write_seek_read_round_trip() {
		let fs = small_fs();
		let mut file = FileDescriptor::open(
			&fs,
			b"/a",
			open_flags::READ | open_flags::WRITE | open_flags::CREATE,
		)
		.unwrap();
		assert_eq!(file.write(&fs, b"hello").unwrap(), 5);
		assert_eq!(file.seek(&fs, 0, Whence::Set).unwrap(), 0);
		let mut buf = [0u8; 5];
		assert_eq!(file.read(&fs, &mut buf).unwrap(), 5);
		assert_eq!(&buf, b"hello");
		file.close(&fs).unwrap();
	}

	#[test]
	fn directory_listing_yields_dot_dotdot_and_child() {
		let fs = small_fs();
		let mut root = fs.ext2.read_inode(crate::fs::ext2::inode::ROOT_INODE).unwrap();
		fs.ext2.create(&mut root, b"d", inode::S_IFDIR | 0o755).unwrap();
		let mut dir = FileDescriptor::open(&fs, b"/d", open_flags::READ).unwrap();
		let mut names = Vec::new();
		while let Some(entry) = dir.read_dir(&fs).unwrap() {
			names.push(entry.name);
		}
		assert_eq!(names, alloc::vec![b".".to_vec(), b"..".to_vec()]);
		dir.close(&fs).unwrap();
	}

	#[test]
	fn seeking_past_eof_on_a_writable_file_zero_fills() {
		let fs = small_fs();
		let mut file =
			FileDescriptor::open(&fs, b"/b", open_flags::READ | open_flags::WRITE | open_flags::CREATE).unwrap();
		file.seek(&fs, 10, Whence::Set).unwrap();
		let stat = file.stat(&fs).unwrap();
		assert_eq!(stat.size, 10);
		file.close(&fs).unwrap();
	}

	#[test]
	fn delete_on_close_removes_the_directory_entry() {
		let fs = small_fs();
		let file = FileDescriptor::open(
			&fs,
			b"/c",
			open_flags::WRITE | open_flags::CREATE | open_flags::DELETE_ON_CLOSE,
		)
		.unwrap();
		file.close(&fs).unwrap();
		assert_eq!(fs.ext2.lookup(b"/c").unwrap_err(), errno::ENOENT);
	}

	#[test]
	fn duplicate_tracks_an_independent_cursor() {
		let fs = small_fs();
		let mut file =
			FileDescriptor::open(&fs, b"/d2", open_flags::READ | open_flags::WRITE | open_flags::CREATE).unwrap();
		file.write(&fs, b"abcdef").unwrap();
		file.seek(&fs, 0, Whence::Set).unwrap();
		let mut dup = file.duplicate();
		let mut buf = [0u8; 3];
		dup.read(&fs, &mut buf).unwrap();
		assert_eq!(&buf, b"abc");
		let mut buf2 = [0u8; 3];
		file.read(&fs, &mut buf2).unwrap();
		assert_eq!(&buf2, b"abc");
		file.close(&fs).unwrap();
		dup.close(&fs).unwrap();
	}
}
