//! Errno values returned at the VFS boundary.
//!
//! Every on-disk routine below this layer returns a bool or a sentinel
//! (`INVALID`); it is the descriptor layer (`file::vfs`) that turns those
//! into one of the codes here.

/// An Unix-style error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
	/// Returns the raw numeric code, as a syscall return value would carry it.
	pub const fn as_i32(self) -> i32 {
		self.0
	}
}

/// Convenience alias used throughout the crate instead of a bare `Result`.
pub type EResult<T> = Result<T, Errno>;

macro_rules! errno_consts {
	($($(#[$doc:meta])* $name:ident = $val:expr;)*) => {
		$(
			$(#[$doc])*
			pub const $name: Errno = Errno($val);
		)*
	};
}

errno_consts! {
	/// Operation not permitted.
	EPERM = 1;
	/// No such file or directory.
	ENOENT = 2;
	/// I/O error.
	EIO = 5;
	/// Bad file descriptor.
	EBADF = 9;
	/// Out of memory.
	ENOMEM = 12;
	/// Permission denied.
	EACCES = 13;
	/// File exists.
	EEXIST = 17;
	/// Not a directory.
	ENOTDIR = 20;
	/// Is a directory.
	EISDIR = 21;
	/// Invalid argument.
	EINVAL = 22;
	/// No space left on device.
	ENOSPC = 28;
	/// Illegal seek.
	ESPIPE = 29;
	/// Broken pipe.
	EPIPE = 32;
	/// Resource temporarily unavailable.
	EAGAIN = 35;
	/// Interrupted function call.
	EINTR = 4;
	/// Directory not empty.
	ENOTEMPTY = 90;
}

/// Builds an [`EResult::Err`] from one of the constants above; mirrors the
/// `errno!` convenience macro kernels of this shape tend to carry, so call
/// sites read `return Err(errno!(ENOENT))` rather than spelling out `Err`.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::$name
	};
}
