//! Watcher options and the symlink-following policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Optional, typically platform-specific watch settings.
///
/// Options are consulted only by the backend that understands them and are
/// silently ignored everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherOption {
	/// Buffer size in bytes for `ReadDirectoryChangesW`.
	///
	/// The default of 63 KiB is sometimes not enough and events get
	/// dropped. Network drives reject buffers larger than 64 KiB.
	WinBufferSize(u32),
	/// Bitwise OR of Windows `FILE_NOTIFY_CHANGE_*` flags; defaults to all
	/// change types.
	WinNotifyFilter(u32),
}

// Consulted by the ReadDirectoryChangesW backend only.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn win_buffer_size(options: &[WatcherOption]) -> Option<u32> {
	options.iter().find_map(|opt| match opt {
		WatcherOption::WinBufferSize(size) => Some(*size),
		_ => None,
	})
}

#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn win_notify_filter(options: &[WatcherOption]) -> Option<u32> {
	options.iter().find_map(|opt| match opt {
		WatcherOption::WinNotifyFilter(mask) => Some(*mask),
		_ => None,
	})
}

/// How recursive expansion treats symbolic links.
///
/// Shared between the facade (which owns the setters) and the backend
/// workers (which consult it while expanding directory trees), so both
/// flags are atomics behind one `Arc`.
#[derive(Debug, Default)]
pub(crate) struct SymlinkPolicy {
	follow: AtomicBool,
	out_of_scope: AtomicBool,
}

impl SymlinkPolicy {
	pub(crate) fn shared() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub(crate) fn follow_symlinks(&self) -> bool {
		self.follow.load(Ordering::Relaxed)
	}

	pub(crate) fn set_follow_symlinks(&self, follow: bool) {
		self.follow.store(follow, Ordering::Relaxed);
	}

	pub(crate) fn allow_out_of_scope(&self) -> bool {
		self.out_of_scope.load(Ordering::Relaxed)
	}

	pub(crate) fn set_allow_out_of_scope(&self, allow: bool) {
		self.out_of_scope.store(allow, Ordering::Relaxed);
	}
}
