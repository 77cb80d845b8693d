//! Cross-platform directory watching with normalized change events.
//!
//! `watchdir` observes directories on a local filesystem and delivers
//! asynchronous callbacks when their contents change. It wraps the four
//! dominant OS notification mechanisms (inotify on Linux,
//! `ReadDirectoryChangesW` on Windows, FSEvents on macOS, kqueue on the
//! BSDs) behind one contract and ships a polling backend that works
//! anywhere, including the network mounts the native mechanisms refuse.
//!
//! # Architecture
//!
//! - **`FileWatcher`**: the facade. Owns exactly one backend, forwards
//!   registration calls to it, and carries the symlink policy.
//! - **Backends**: per-platform adapters that own a worker thread and
//!   translate raw kernel notifications into normalized [`Event`]s.
//! - **[`FileWatchListener`]**: the callback contract; implemented for
//!   closures and for `crossbeam_channel::Sender<Event>`.
//!
//! Callbacks for a single watch are always serialized. Every backend except
//! FSEvents delivers from one thread per `FileWatcher`, which serializes
//! callbacks across watches too; FSEvents runs one runloop per watch, so
//! callbacks for *different* watches may overlap there.
//!
//! # Example
//!
//! ```no_run
//! use watchdir::{Action, FileWatcher};
//!
//! fn main() -> watchdir::Result<()> {
//!     let mut watcher = FileWatcher::new()?;
//!
//!     let id = watcher.add_watch(
//!         "/var/log",
//!         std::sync::Arc::new(|event: watchdir::Event| {
//!             println!(
//!                 "[{}] {} {}",
//!                 event.watch_id,
//!                 event.action.name(),
//!                 event.filename.display(),
//!             );
//!             if event.action == Action::Moved {
//!                 if let Some(old) = &event.old_filename {
//!                     println!("  (was {})", old.display());
//!                 }
//!             }
//!         }),
//!         false,
//!     )?;
//!
//!     watcher.watch();
//!     // ... later ...
//!     watcher.remove_watch_id(id);
//!     Ok(())
//! }
//! ```

mod backend;
mod config;
mod error;
mod event;
mod paths;
mod registry;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backend::poll::PollBackend;
use backend::{Backend, NativeBackend};
use config::SymlinkPolicy;

pub use config::WatcherOption;
pub use error::{clear_last_error, last_error_code, last_error_log, Error, Result};
pub use event::{Action, Event, WatchId};

/// Receives change notifications for a watch.
///
/// Invoked from the backend's worker thread. Calls for one watch are never
/// made concurrently; see the crate docs for the cross-watch guarantees.
pub trait FileWatchListener: Send + Sync {
	/// Handles one normalized change event. `event.old_filename` is only
	/// populated for [`Action::Moved`].
	fn handle_file_action(&self, event: Event);
}

impl<F> FileWatchListener for F
where
	F: Fn(Event) + Send + Sync,
{
	fn handle_file_action(&self, event: Event) {
		(self)(event);
	}
}

/// Lets a channel act as a listener, collecting events for another thread.
impl FileWatchListener for crossbeam_channel::Sender<Event> {
	fn handle_file_action(&self, event: Event) {
		let _ = self.send(event);
	}
}

enum BackendKind {
	Native(NativeBackend),
	Generic(PollBackend),
}

/// Watches directories and dispatches change events to listeners.
///
/// Dropping the watcher stops its worker, waits out in-flight deliveries,
/// and releases all platform resources.
pub struct FileWatcher {
	backend: BackendKind,
	policy: Arc<SymlinkPolicy>,
}

impl FileWatcher {
	/// Creates a watcher using the best backend for this platform.
	pub fn new() -> Result<Self> {
		let policy = SymlinkPolicy::shared();
		Ok(Self {
			backend: BackendKind::Native(native_backend(policy.clone())?),
			policy,
		})
	}

	/// Creates a watcher that always uses the generic polling backend.
	///
	/// Slower than the native backends but immune to their platform
	/// limits, and the only option for remote filesystems.
	pub fn new_generic() -> Self {
		let policy = SymlinkPolicy::shared();
		Self {
			backend: BackendKind::Generic(PollBackend::new(policy.clone())),
			policy,
		}
	}

	fn backend(&self) -> &dyn Backend {
		match &self.backend {
			BackendKind::Native(backend) => backend,
			BackendKind::Generic(backend) => backend,
		}
	}

	fn backend_mut(&mut self) -> &mut dyn Backend {
		match &mut self.backend {
			BackendKind::Native(backend) => backend,
			BackendKind::Generic(backend) => backend,
		}
	}

	/// Registers a directory watch and returns its id.
	///
	/// The directory must exist, be readable, and (for native backends)
	/// live on a local filesystem. Watching the same canonical directory
	/// twice fails with [`Error::FileRepeated`]. Failures are also
	/// recorded in the last-error slot; see [`last_error_code`].
	pub fn add_watch(
		&mut self,
		directory: impl AsRef<Path>,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
	) -> Result<WatchId> {
		self.add_watch_with_options(directory, listener, recursive, &[])
	}

	/// Like [`FileWatcher::add_watch`], with backend-specific options.
	pub fn add_watch_with_options(
		&mut self,
		directory: impl AsRef<Path>,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		options: &[WatcherOption],
	) -> Result<WatchId> {
		self.backend_mut()
			.add_watch(directory.as_ref(), listener, recursive, options)
	}

	/// Removes the watch rooted at `directory`. Unknown paths are ignored.
	///
	/// Once this returns, no further events are delivered for the watch.
	pub fn remove_watch(&mut self, directory: impl AsRef<Path>) {
		self.backend_mut().remove_watch_path(directory.as_ref());
	}

	/// Removes a watch by id. Unknown ids are ignored.
	///
	/// Once this returns, no further events are delivered for the watch.
	pub fn remove_watch_id(&mut self, id: WatchId) {
		self.backend_mut().remove_watch_id(id);
	}

	/// Starts the background worker delivering events. Idempotent.
	pub fn watch(&mut self) {
		self.backend_mut().watch();
	}

	/// The canonical roots currently being watched.
	pub fn directories(&self) -> Vec<PathBuf> {
		self.backend().directories()
	}

	/// Allows recursive watches to follow symbolic links to directories.
	/// Disabled by default.
	pub fn follow_symlinks(&mut self, follow: bool) {
		self.policy.set_follow_symlinks(follow);
	}

	/// Whether symbolic links to directories are followed.
	pub fn follows_symlinks(&self) -> bool {
		self.policy.follow_symlinks()
	}

	/// Allows followed symlinks to escape the watched root's subtree.
	///
	/// Only meaningful with [`FileWatcher::follow_symlinks`] enabled; kept
	/// off by default because an out-of-scope link can pull arbitrarily
	/// large trees into the watch.
	pub fn allow_out_of_scope_links(&mut self, allow: bool) {
		self.policy.set_allow_out_of_scope(allow);
	}

	/// Whether out-of-scope symlink targets may be entered.
	pub fn allows_out_of_scope_links(&self) -> bool {
		self.policy.allow_out_of_scope()
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn native_backend(policy: Arc<SymlinkPolicy>) -> Result<NativeBackend> {
	backend::inotify::InotifyBackend::new(policy)
}

#[cfg(any(
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly",
	target_os = "ios"
))]
fn native_backend(policy: Arc<SymlinkPolicy>) -> Result<NativeBackend> {
	backend::kqueue::KqueueBackend::new(policy)
}

#[cfg(target_os = "macos")]
fn native_backend(policy: Arc<SymlinkPolicy>) -> Result<NativeBackend> {
	Ok(backend::fsevents::FsEventsBackend::new(policy))
}

#[cfg(windows)]
fn native_backend(policy: Arc<SymlinkPolicy>) -> Result<NativeBackend> {
	backend::windows::RdcwBackend::new(policy)
}

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
fn native_backend(policy: Arc<SymlinkPolicy>) -> Result<NativeBackend> {
	Ok(PollBackend::new(policy))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop_listener() -> Arc<dyn FileWatchListener> {
		Arc::new(|_event: Event| {})
	}

	#[test]
	fn directories_tracks_watches() {
		let dir = tempfile::tempdir().unwrap();
		let mut watcher = FileWatcher::new_generic();

		let id = watcher
			.add_watch(dir.path(), noop_listener(), false)
			.unwrap();
		assert!(id > 0);

		let canonical = dir.path().canonicalize().unwrap();
		assert_eq!(watcher.directories(), vec![canonical]);

		watcher.remove_watch_id(id);
		assert!(watcher.directories().is_empty());
	}

	#[test]
	fn duplicate_add_reports_file_repeated() {
		let dir = tempfile::tempdir().unwrap();
		let mut watcher = FileWatcher::new_generic();

		watcher
			.add_watch(dir.path(), noop_listener(), false)
			.unwrap();

		clear_last_error();
		let err = watcher
			.add_watch(dir.path(), noop_listener(), false)
			.unwrap_err();
		assert!(matches!(err, Error::FileRepeated(_)));
		assert_eq!(err.code(), -2);
		assert_eq!(last_error_code(), -2);
	}

	#[test]
	fn missing_directory_reports_file_not_found() {
		let mut watcher = FileWatcher::new_generic();
		let err = watcher
			.add_watch("/definitely/not/a/real/dir", noop_listener(), false)
			.unwrap_err();
		assert!(matches!(err, Error::FileNotFound(_)));
		assert_eq!(err.code(), -1);
	}

	#[test]
	fn policy_toggles_round_trip() {
		let mut watcher = FileWatcher::new_generic();
		assert!(!watcher.follows_symlinks());
		assert!(!watcher.allows_out_of_scope_links());

		watcher.follow_symlinks(true);
		watcher.allow_out_of_scope_links(true);
		assert!(watcher.follows_symlinks());
		assert!(watcher.allows_out_of_scope_links());
	}

	#[test]
	fn remove_unknown_targets_is_silent() {
		let mut watcher = FileWatcher::new_generic();
		watcher.remove_watch("/nope");
		watcher.remove_watch_id(42);
		assert!(watcher.directories().is_empty());
	}

	#[test]
	fn watch_is_idempotent() {
		let mut watcher = FileWatcher::new_generic();
		watcher.watch();
		watcher.watch();
	}
}
