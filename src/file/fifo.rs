//! Named FIFOs: a bounded byte ring per path, shared by every descriptor
//! that has it open, guarded by its own lock behind a global registry lock
//! acquired first, then the per-entry lock second, never the reverse.

use super::open_flags;
use crate::errno::{self, EResult};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

const RING_CAPACITY: usize = 4096;

struct FifoEntry {
	readers: usize,
	writers: usize,
	buffer: [u8; RING_CAPACITY],
	head: usize,
}

impl FifoEntry {
	fn new() -> Self {
		Self {
			readers: 0,
			writers: 0,
			buffer: [0; RING_CAPACITY],
			head: 0,
		}
	}
}

/// `path -> live entry`. An entry is created on first open of a path and
/// removed once both reader and writer counts drop to zero.
#[derive(Default)]
pub struct FifoRegistry {
	entries: Mutex<BTreeMap<Vec<u8>, Arc<Mutex<FifoEntry>>>>,
}

/// One open side (reader xor writer) of a FIFO.
pub struct FifoHandle {
	path: Vec<u8>,
	entry: Arc<Mutex<FifoEntry>>,
	is_writer: bool,
	nonblocking: bool,
}

impl FifoRegistry {
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(BTreeMap::new()),
		}
	}

	/// Finds or creates the entry for `path`, registers this side, then —
	/// unless `NONBLOCKING` — spin-yields until the opposing side is
	/// present.
	pub fn open(&self, path: &[u8], mode: u32) -> EResult<FifoHandle> {
		let is_writer = mode & open_flags::WRITE != 0;
		let nonblocking = mode & open_flags::NONBLOCKING != 0;
		let entry = {
			let mut table = self.entries.lock();
			table
				.entry(path.to_vec())
				.or_insert_with(|| Arc::new(Mutex::new(FifoEntry::new())))
				.clone()
		};
		{
			let mut e = entry.lock();
			if is_writer {
				e.writers += 1;
			} else {
				e.readers += 1;
			}
		}
		if !nonblocking {
			loop {
				let ready = {
					let e = entry.lock();
					if is_writer {
						e.readers > 0
					} else {
						e.writers > 0 || e.head > 0
					}
				};
				if ready {
					break;
				}
				core::hint::spin_loop();
			}
		}
		Ok(FifoHandle {
			path: path.to_vec(),
			entry,
			is_writer,
			nonblocking,
		})
	}

	fn evict_if_dead(&self, path: &[u8]) {
		let mut table = self.entries.lock();
		let dead = table
			.get(path)
			.map(|e| {
				let e = e.lock();
				e.readers == 0 && e.writers == 0
			})
			.unwrap_or(false);
		if dead {
			table.remove(path);
		}
	}
}

impl FifoHandle {
	/// One read: blocks (unless `NONBLOCKING`) until bytes are available or
	/// every writer has gone away, then drains `min(n, head)` bytes in a
	/// single copy plus a `memmove` of the remainder.
	pub fn read(&self, buf: &mut [u8]) -> EResult<usize> {
		if self.is_writer {
			return Err(errno::EBADF);
		}
		loop {
			let mut e = self.entry.lock();
			if e.writers == 0 && e.head == 0 {
				return Ok(0);
			}
			if e.head == 0 {
				if self.nonblocking {
					return Err(errno::EAGAIN);
				}
				drop(e);
				core::hint::spin_loop();
				continue;
			}
			let n = core::cmp::min(buf.len(), e.head);
			buf[..n].copy_from_slice(&e.buffer[..n]);
			let head = e.head;
			e.buffer.copy_within(n..head, 0);
			e.head -= n;
			return Ok(n);
		}
	}

	/// One write: a single `min(n, space)` copy into the tail once space is
	/// available. A caller writing more than fits makes repeated calls —
	/// that repetition, not this function, is what blocks a large write
	/// until a reader drains the ring.
	pub fn write(&self, buf: &[u8]) -> EResult<usize> {
		if !self.is_writer {
			return Err(errno::EBADF);
		}
		loop {
			let mut e = self.entry.lock();
			if e.readers == 0 {
				// A real kernel also delivers SIGPIPE to the current task;
				// signal delivery is outside this layer's scope.
				return Err(errno::EPIPE);
			}
			if e.head == RING_CAPACITY {
				if self.nonblocking {
					return Err(errno::EAGAIN);
				}
				drop(e);
				core::hint::spin_loop();
				continue;
			}
			let n = core::cmp::min(buf.len(), RING_CAPACITY - e.head);
			let head = e.head;
			e.buffer[head..head + n].copy_from_slice(&buf[..n]);
			e.head += n;
			return Ok(n);
		}
	}

	/// Bytes available to read without blocking (`FIONREAD`).
	pub fn available(&self) -> usize {
		self.entry.lock().head
	}

	pub fn is_writer(&self) -> bool {
		self.is_writer
	}

	/// Drops this side's reference; once both counters hit zero the entry
	/// is unlinked from the registry.
	pub fn close(&self, registry: &FifoRegistry) {
		{
			let mut e = self.entry.lock();
			if self.is_writer {
				e.writers = e.writers.saturating_sub(1);
			} else {
				e.readers = e.readers.saturating_sub(1);
			}
		}
		registry.evict_if_dead(&self.path);
	}

	/// Adds another reference of the same side, as `dup` would.
	pub fn duplicate(&self) -> FifoHandle {
		let mut e = self.entry.lock();
		if self.is_writer {
			e.writers += 1;
		} else {
			e.readers += 1;
		}
		drop(e);
		FifoHandle {
			path: self.path.clone(),
			entry: self.entry.clone(),
			is_writer: self.is_writer,
			nonblocking: self.nonblocking,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nonblocking_open_does_not_wait_for_a_peer() {
		let registry = FifoRegistry::new();
		let handle = registry
			.open(b"/p", open_flags::READ | open_flags::NONBLOCKING)
			.unwrap();
		assert_eq!(handle.available(), 0);
	}

	#[test]
	fn write_with_no_readers_is_epipe() {
		let registry = FifoRegistry::new();
		let handle = registry
			.open(b"/p", open_flags::WRITE | open_flags::NONBLOCKING)
			.unwrap();
		assert_eq!(handle.write(b"x").unwrap_err(), errno::EPIPE);
	}

	#[test]
	fn read_with_no_writers_and_empty_ring_is_eof() {
		let registry = FifoRegistry::new();
		let handle = registry
			.open(b"/p", open_flags::READ | open_flags::NONBLOCKING)
			.unwrap();
		let mut buf = [0u8; 8];
		assert_eq!(handle.read(&mut buf).unwrap(), 0);
	}

	#[test]
	fn nonblocking_read_on_empty_but_open_ring_is_eagain() {
		let registry = FifoRegistry::new();
		let _writer = registry
			.open(b"/p", open_flags::WRITE | open_flags::NONBLOCKING)
			.unwrap();
		let reader = registry
			.open(b"/p", open_flags::READ | open_flags::NONBLOCKING)
			.unwrap();
		let mut buf = [0u8; 8];
		assert_eq!(reader.read(&mut buf).unwrap_err(), errno::EAGAIN);
	}

	#[test]
	fn closing_both_sides_evicts_the_entry() {
		let registry = FifoRegistry::new();
		let writer = registry
			.open(b"/p", open_flags::WRITE | open_flags::NONBLOCKING)
			.unwrap();
		let reader = registry
			.open(b"/p", open_flags::READ | open_flags::NONBLOCKING)
			.unwrap();
		writer.close(&registry);
		reader.close(&registry);
		assert!(registry.entries.lock().is_empty());
	}

	#[test]
	fn blocking_open_pairs_up_and_a_large_write_drains_through_reads() {
		use std::thread;

		let registry = std::sync::Arc::new(FifoRegistry::new());
		let path: &[u8] = b"/p";

		let reader_registry = registry.clone();
		let reader = thread::spawn(move || {
			let handle = reader_registry.open(path, open_flags::READ).unwrap();
			let mut received = Vec::new();
			let mut buf = [0u8; 4096];
			while received.len() < 8192 {
				match handle.read(&mut buf) {
					Ok(0) => continue,
					Ok(n) => received.extend_from_slice(&buf[..n]),
					Err(_) => continue,
				}
			}
			handle.close(&reader_registry);
			received
		});

		let handle = registry.open(path, open_flags::WRITE).unwrap();
		let data = vec![9u8; 8192];
		let mut total = 0;
		while total < data.len() {
			total += handle.write(&data[total..]).unwrap();
		}
		handle.close(&registry);

		assert_eq!(reader.join().unwrap(), data);
	}
}
