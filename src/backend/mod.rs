//! Backend contract and platform selection.
//!
//! Each platform adapter translates its kernel's notification stream into
//! the normalized [`Event`](crate::Event) model behind one small trait. The
//! facade owns exactly one backend, chosen at construction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::WatcherOption;
use crate::error::Result;
use crate::event::WatchId;
use crate::FileWatchListener;

pub(crate) mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod inotify;

#[cfg(any(
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly",
	target_os = "ios"
))]
pub(crate) mod kqueue;

#[cfg(target_os = "macos")]
pub(crate) mod fsevents;

#[cfg(windows)]
pub(crate) mod windows;

/// The platform-best backend type.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) type NativeBackend = inotify::InotifyBackend;
#[cfg(any(
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly",
	target_os = "ios"
))]
pub(crate) type NativeBackend = kqueue::KqueueBackend;
#[cfg(target_os = "macos")]
pub(crate) type NativeBackend = fsevents::FsEventsBackend;
#[cfg(windows)]
pub(crate) type NativeBackend = windows::RdcwBackend;
#[cfg(not(any(
	target_os = "linux",
	target_os = "android",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly",
	target_os = "ios",
	target_os = "macos",
	windows
)))]
pub(crate) type NativeBackend = poll::PollBackend;

/// Contract every platform adapter implements.
///
/// Backends own their worker thread and registry, and invoke listeners with
/// fully normalized events. Shutdown happens on drop: stop the worker, drain
/// in-flight deliveries, release platform handles.
pub(crate) trait Backend: Send {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		options: &[WatcherOption],
	) -> Result<WatchId>;

	fn remove_watch_path(&mut self, path: &Path);

	fn remove_watch_id(&mut self, id: WatchId);

	/// Starts the worker thread; idempotent once running.
	fn watch(&mut self);

	fn directories(&self) -> Vec<PathBuf>;
}

/// Lifecycle of a backend worker thread.
#[derive(Debug)]
pub(crate) struct WorkerState(AtomicU8);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

impl WorkerState {
	pub(crate) fn new() -> Self {
		Self(AtomicU8::new(IDLE))
	}

	/// Idle -> Running. Returns false when the worker was already started.
	pub(crate) fn start(&self) -> bool {
		self.0
			.compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Running -> Stopping.
	pub(crate) fn request_stop(&self) {
		let _ = self
			.0
			.compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire);
	}

	pub(crate) fn mark_stopped(&self) {
		self.0.store(STOPPED, Ordering::Release);
	}

	// Only the FSEvents backend needs to ask; the others gate on start().
	#[allow(dead_code)]
	pub(crate) fn is_running(&self) -> bool {
		self.0.load(Ordering::Acquire) == RUNNING
	}
}

/// Lifecycle of a single watch registration. Events are dispatched only
/// while Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchState {
	Active,
	Removing,
	Dead,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn worker_start_is_one_shot() {
		let state = WorkerState::new();
		assert!(state.start());
		assert!(!state.start());
		assert!(state.is_running());

		state.request_stop();
		assert!(!state.is_running());
		state.mark_stopped();
		assert!(!state.start());
	}
}
