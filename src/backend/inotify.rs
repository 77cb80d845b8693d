//! Linux backend on top of inotify.
//!
//! One worker thread reads a single inotify fd for the whole `FileWatcher`.
//! The kernel only supports per-directory subscriptions, so recursion is
//! emulated: every directory under a recursive root gets its own watch
//! descriptor, installed synchronously when the directory is first seen so
//! that files created immediately afterwards are not missed.
//!
//! Rename pairing: `MOVED_FROM`/`MOVED_TO` events sharing a cookie are
//! coalesced into one `Moved` when both arrive in the same read. A dangling
//! `MOVED_FROM` means the entry left the watched tree and becomes a `Delete`
//! after a grace period; a dangling `MOVED_TO` came from outside and is an
//! `Add` right away. No pairing is attempted across reads.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{Backend, WatchState, WorkerState};
use crate::config::{SymlinkPolicy, WatcherOption};
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::paths;
use crate::registry::Registry;
use crate::FileWatchListener;

/// How long a dangling `MOVED_FROM` may wait for its pair before it is
/// reported as a deletion.
const MOVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker wakes up at least this often to check for shutdown and evict
/// stale moves.
const POLL_TIMEOUT_MS: i32 = 250;

fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MODIFY
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::ATTRIB
		| WatchMask::MOVE_SELF
		| WatchMask::DELETE_SELF
}

struct InotifyWatch {
	id: WatchId,
	root: PathBuf,
	listener: Arc<dyn FileWatchListener>,
	recursive: bool,
	state: WatchState,
}

struct WdEntry {
	watch_id: WatchId,
	dir: PathBuf,
}

/// Registry and descriptor index, mutated together under one lock.
struct InotifyState {
	registry: Registry<InotifyWatch>,
	wds: HashMap<WatchDescriptor, WdEntry>,
}

/// Raw event copied out of the read buffer so translation can outlive it.
struct RawEvent {
	wd: WatchDescriptor,
	mask: EventMask,
	cookie: u32,
	name: Option<OsString>,
}

/// A `MOVED_FROM` waiting for its pair or for eviction.
struct PendingMove {
	watch_id: WatchId,
	dir: PathBuf,
	name: OsString,
	is_dir: bool,
	since: Instant,
}

struct InotifyShared {
	state: Mutex<InotifyState>,
	watches: Mutex<Watches>,
	delivery: Mutex<()>,
	worker_state: WorkerState,
	policy: Arc<SymlinkPolicy>,
	shutdown: AtomicBool,
	failed: AtomicBool,
}

pub(crate) struct InotifyBackend {
	shared: Arc<InotifyShared>,
	inotify: Option<Inotify>,
	fd: RawFd,
	worker: Option<thread::JoinHandle<()>>,
}

impl InotifyBackend {
	pub(crate) fn new(policy: Arc<SymlinkPolicy>) -> Result<Self> {
		let mut inotify = Inotify::init()
			.map_err(|e| Error::WatcherFailed(format!("inotify init failed: {e}")).log())?;
		let fd = inotify.as_raw_fd();
		let watches = inotify.watches();

		Ok(Self {
			shared: Arc::new(InotifyShared {
				state: Mutex::new(InotifyState {
					registry: Registry::new(),
					wds: HashMap::new(),
				}),
				watches: Mutex::new(watches),
				delivery: Mutex::new(()),
				worker_state: WorkerState::new(),
				policy,
				shutdown: AtomicBool::new(false),
				failed: AtomicBool::new(false),
			}),
			inotify: Some(inotify),
			fd,
			worker: None,
		})
	}

	fn drain_delivery(&self) {
		drop(self.shared.delivery.lock());
	}
}

impl Backend for InotifyBackend {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		_options: &[WatcherOption],
	) -> Result<WatchId> {
		if self.shared.failed.load(Ordering::Acquire) {
			return Err(Error::WatcherFailed("inotify worker is down".into()).log());
		}

		let canonical = paths::resolve_root(path, &self.shared.policy).map_err(Error::log)?;

		if paths::is_remote_fs(&canonical) {
			return Err(Error::FileRemote(canonical).log());
		}

		let mut state = self.shared.state.lock();
		if state.registry.contains_path(&canonical) {
			return Err(Error::FileRepeated(canonical).log());
		}

		let id = state
			.registry
			.insert(canonical.clone(), |id| InotifyWatch {
				id,
				root: canonical.clone(),
				listener,
				recursive,
				state: WatchState::Active,
			})
			.map_err(Error::log)?;

		// Watch descriptors for the root and, for recursive watches, every
		// descendant directory are installed before the call returns.
		if let Err(e) = install_tree(
			&self.shared,
			&mut state,
			id,
			&canonical,
			&canonical,
			recursive,
		) {
			state.registry.remove_id(id);
			let wds: Vec<WatchDescriptor> = state
				.wds
				.iter()
				.filter(|(_, entry)| entry.watch_id == id)
				.map(|(wd, _)| wd.clone())
				.collect();
			for wd in wds {
				state.wds.remove(&wd);
				let _ = self.shared.watches.lock().remove(wd);
			}
			return Err(e.log());
		}

		debug!(path = %canonical.display(), id, recursive, "added inotify watch");
		Ok(id)
	}

	fn remove_watch_path(&mut self, path: &Path) {
		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		let removed = {
			let mut state = self.shared.state.lock();
			let removed = state.registry.remove_path(&canonical);
			removed.map(|(id, _)| (id, detach_descriptors(&mut state, id)))
		};
		if let Some((id, wds)) = removed {
			release_descriptors(&self.shared, wds);
			self.drain_delivery();
			debug!(path = %canonical.display(), id, "removed inotify watch");
		}
	}

	fn remove_watch_id(&mut self, id: WatchId) {
		let removed = {
			let mut state = self.shared.state.lock();
			state
				.registry
				.remove_id(id)
				.map(|_| detach_descriptors(&mut state, id))
		};
		if let Some(wds) = removed {
			release_descriptors(&self.shared, wds);
			self.drain_delivery();
			debug!(id, "removed inotify watch");
		}
	}

	fn watch(&mut self) {
		if !self.shared.worker_state.start() {
			return;
		}
		let Some(inotify) = self.inotify.take() else {
			return;
		};

		let shared = self.shared.clone();
		let fd = self.fd;
		let spawned = thread::Builder::new()
			.name("watchdir-inotify".into())
			.spawn(move || run_worker(shared, inotify, fd));

		match spawned {
			Ok(handle) => self.worker = Some(handle),
			Err(e) => {
				error!("failed to spawn inotify worker: {e}");
				error::record(&Error::WatcherFailed(format!(
					"failed to spawn inotify worker: {e}"
				)));
				self.shared.failed.store(true, Ordering::Release);
				self.shared.worker_state.mark_stopped();
			}
		}
	}

	fn directories(&self) -> Vec<PathBuf> {
		self.shared.state.lock().registry.directories()
	}
}

impl Drop for InotifyBackend {
	fn drop(&mut self) {
		self.shared.worker_state.request_stop();
		self.shared.shutdown.store(true, Ordering::Release);
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
	}
}

/// Installs watch descriptors for `dir` and (for recursive watches) its
/// descendants, honoring the symlink policy.
///
/// The kernel hands back the same descriptor for the same inode, so a
/// descriptor already present in the index means this directory is reached
/// a second time through a symlink; it is not entered again, which also
/// breaks link cycles. Only the top-level add is fatal; failures deeper in
/// the tree are logged and skipped.
fn install_tree(
	shared: &InotifyShared,
	state: &mut InotifyState,
	watch_id: WatchId,
	root: &Path,
	dir: &Path,
	recursive: bool,
) -> Result<()> {
	let wd = shared
		.watches
		.lock()
		.add(dir, watch_mask())
		.map_err(|e| match e.kind() {
			io::ErrorKind::PermissionDenied => Error::FileNotReadable(dir.to_path_buf()),
			io::ErrorKind::NotFound => Error::FileNotFound(dir.to_path_buf()),
			_ => Error::WatcherFailed(format!("inotify add_watch {}: {e}", dir.display())),
		})?;

	if state.wds.contains_key(&wd) {
		return Ok(());
	}
	state.wds.insert(
		wd,
		WdEntry {
			watch_id,
			dir: dir.to_path_buf(),
		},
	);

	if !recursive {
		return Ok(());
	}

	let entries = match std::fs::read_dir(dir) {
		Ok(entries) => entries,
		// The directory may vanish between the add and the walk.
		Err(_) => return Ok(()),
	};
	for entry in entries.flatten() {
		let Ok(file_type) = entry.file_type() else {
			continue;
		};
		let child = entry.path();
		let enter = if file_type.is_dir() {
			true
		} else if file_type.is_symlink() {
			std::fs::canonicalize(&child)
				.map(|target| {
					target.is_dir() && paths::link_allowed(&target, root, &shared.policy)
				})
				.unwrap_or(false)
		} else {
			false
		};
		if enter {
			if let Err(e) = install_tree(shared, state, watch_id, root, &child, true) {
				warn!(dir = %child.display(), "skipping unwatchable subdirectory: {e}");
			}
		}
	}

	Ok(())
}

/// Removes every descriptor index entry belonging to `watch_id`, returning
/// the descriptors for the caller to close outside the state lock.
fn detach_descriptors(state: &mut InotifyState, watch_id: WatchId) -> Vec<WatchDescriptor> {
	let wds: Vec<WatchDescriptor> = state
		.wds
		.iter()
		.filter(|(_, entry)| entry.watch_id == watch_id)
		.map(|(wd, _)| wd.clone())
		.collect();
	for wd in &wds {
		state.wds.remove(wd);
	}
	wds
}

fn release_descriptors(shared: &InotifyShared, wds: Vec<WatchDescriptor>) {
	let mut watches = shared.watches.lock();
	for wd in wds {
		// Failure here just means the kernel already dropped it.
		let _ = watches.remove(wd);
	}
}

fn run_worker(shared: Arc<InotifyShared>, mut inotify: Inotify, fd: RawFd) {
	debug!("inotify worker started");
	let mut buffer = [0u8; 4096];
	let mut pending_moves: Vec<PendingMove> = Vec::new();

	loop {
		if shared.shutdown.load(Ordering::Acquire) {
			break;
		}

		let mut pollfd = libc::pollfd {
			fd,
			events: libc::POLLIN,
			revents: 0,
		};
		// SAFETY: pollfd points at one valid descriptor for the call.
		let ready = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
		if ready < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::Interrupted {
				continue;
			}
			error!("inotify poll failed: {err}");
			error::record(&Error::WatcherFailed(format!("inotify poll failed: {err}")));
			fail_all(&shared);
			break;
		}

		evict_stale_moves(&shared, &mut pending_moves);

		if ready == 0 {
			continue;
		}

		let batch: Vec<RawEvent> = match inotify.read_events(&mut buffer) {
			Ok(events) => events
				.map(|event| RawEvent {
					wd: event.wd,
					mask: event.mask,
					cookie: event.cookie,
					name: event.name.map(OsString::from),
				})
				.collect(),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
			Err(e) => {
				error!("inotify read failed: {e}");
				error::record(&Error::WatcherFailed(format!("inotify read failed: {e}")));
				fail_all(&shared);
				break;
			}
		};

		process_batch(&shared, batch, &mut pending_moves);
	}

	shared.worker_state.mark_stopped();
	debug!("inotify worker stopped");
}

/// Marks every watch Dead after a fatal worker error.
fn fail_all(shared: &InotifyShared) {
	shared.failed.store(true, Ordering::Release);
	let mut state = shared.state.lock();
	for (_, watch) in state.registry.iter_mut() {
		watch.state = WatchState::Dead;
	}
}

/// Translates one read's worth of raw events and delivers them.
fn process_batch(
	shared: &InotifyShared,
	batch: Vec<RawEvent>,
	pending_moves: &mut Vec<PendingMove>,
) {
	let _delivery = shared.delivery.lock();

	let mut deliveries: Vec<(Arc<dyn FileWatchListener>, Event)> = Vec::new();
	// MOVED_FROM events seen in this batch, keyed by cookie, awaiting a
	// matching MOVED_TO from the same read.
	let mut batch_from: HashMap<u32, (WatchId, PathBuf, OsString, bool)> = HashMap::new();

	{
		let mut state = shared.state.lock();

		for raw in batch {
			if raw.mask.contains(EventMask::Q_OVERFLOW) {
				warn!("inotify event queue overflowed; some events were lost");
				error::record(&Error::Unspecified(
					"inotify event queue overflow, events were lost".into(),
				));
				continue;
			}
			if raw.mask.contains(EventMask::IGNORED) {
				state.wds.remove(&raw.wd);
				continue;
			}

			let Some(entry) = state.wds.get(&raw.wd) else {
				continue;
			};
			let (watch_id, dir) = (entry.watch_id, entry.dir.clone());

			let Some(watch) = state.registry.get_mut(watch_id) else {
				continue;
			};
			if watch.state != WatchState::Active {
				continue;
			}
			let (listener, recursive, root) =
				(watch.listener.clone(), watch.recursive, watch.root.clone());

			if raw
				.mask
				.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF)
			{
				if dir == root {
					warn!(root = %root.display(), "watch root was deleted or moved");
					error::record(&Error::WatcherFailed(format!(
						"watch root deleted or moved: {}",
						root.display()
					)));
					watch.state = WatchState::Removing;
				}
				continue;
			}

			let Some(name) = raw.name else {
				continue;
			};
			let is_dir = raw.mask.contains(EventMask::ISDIR);

			if raw.mask.contains(EventMask::MOVED_FROM) {
				batch_from.insert(raw.cookie, (watch_id, dir, name, is_dir));
				continue;
			}

			if raw.mask.contains(EventMask::MOVED_TO) {
				let paired = batch_from
					.remove(&raw.cookie)
					.filter(|(from_id, from_dir, ..)| {
						// Only a same-parent pair within one watch is a
						// rename; anything else decomposes into
						// Delete + Add.
						*from_id == watch_id && *from_dir == dir
					});

				match paired {
					Some((_, _, old_name, moved_dir)) => {
						if moved_dir && recursive {
							rekey_descriptors(
								&mut state,
								&dir.join(&old_name),
								&dir.join(&name),
							);
						}
						deliveries.push((
							listener,
							Event::moved(watch_id, dir, name, old_name),
						));
					}
					None => {
						if is_dir && recursive {
							let child = dir.join(&name);
							let _ = install_tree(
								shared, &mut state, watch_id, &root, &child, true,
							);
						}
						deliveries
							.push((listener, Event::new(watch_id, dir, name, Action::Add)));
					}
				}
				continue;
			}

			if raw.mask.contains(EventMask::CREATE) {
				if is_dir && recursive {
					// Install the sub-watch before the Add is delivered so
					// creations racing into the new directory are caught.
					let child = dir.join(&name);
					let _ = install_tree(shared, &mut state, watch_id, &root, &child, true);
				}
				deliveries.push((listener, Event::new(watch_id, dir, name, Action::Add)));
			} else if raw.mask.contains(EventMask::DELETE) {
				deliveries.push((listener, Event::new(watch_id, dir, name, Action::Delete)));
			} else if raw.mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
				deliveries.push((
					listener,
					Event::new(watch_id, dir, name, Action::Modified),
				));
			} else {
				trace!(mask = ?raw.mask, "unhandled inotify event");
			}
		}

		// Whatever MOVED_FROMs found no pair in this read wait out the
		// grace period before they turn into deletions.
		for (_, (watch_id, dir, name, is_dir)) in batch_from {
			pending_moves.push(PendingMove {
				watch_id,
				dir,
				name,
				is_dir,
				since: Instant::now(),
			});
		}
	}

	for (listener, event) in deliveries {
		trace!(
			action = event.action.name(),
			directory = %event.directory.display(),
			filename = %event.filename.display(),
			"inotify event"
		);
		listener.handle_file_action(event);
	}
}

/// Turns dangling `MOVED_FROM`s older than the grace period into deletions.
fn evict_stale_moves(shared: &InotifyShared, pending_moves: &mut Vec<PendingMove>) {
	if pending_moves.is_empty() {
		return;
	}

	let _delivery = shared.delivery.lock();
	let mut deliveries: Vec<(Arc<dyn FileWatchListener>, Event)> = Vec::new();

	{
		let mut state = shared.state.lock();
		pending_moves.retain(|pending| {
			if pending.since.elapsed() < MOVE_TIMEOUT {
				return true;
			}

			if pending.is_dir {
				drop_descriptors_under(&mut state, shared, &pending.dir.join(&pending.name));
			}
			if let Some(watch) = state.registry.get_mut(pending.watch_id) {
				if watch.state == WatchState::Active {
					deliveries.push((
						watch.listener.clone(),
						Event::new(
							pending.watch_id,
							pending.dir.clone(),
							pending.name.clone(),
							Action::Delete,
						),
					));
				}
			}
			false
		});
	}

	for (listener, event) in deliveries {
		listener.handle_file_action(event);
	}
}

/// A directory moved within its watch: repoint every descriptor under the
/// old path at the new one.
fn rekey_descriptors(state: &mut InotifyState, from: &Path, to: &Path) {
	for entry in state.wds.values_mut() {
		if let Ok(suffix) = entry.dir.strip_prefix(from).map(Path::to_path_buf) {
			entry.dir = to.join(suffix);
		}
	}
}

/// A directory left the watched tree: forget descriptors under it.
fn drop_descriptors_under(state: &mut InotifyState, shared: &InotifyShared, dir: &Path) {
	let doomed: Vec<WatchDescriptor> = state
		.wds
		.iter()
		.filter(|(_, entry)| entry.dir.starts_with(dir))
		.map(|(wd, _)| wd.clone())
		.collect();
	let mut watches = shared.watches.lock();
	for wd in doomed {
		state.wds.remove(&wd);
		let _ = watches.remove(wd);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crossbeam_channel::{unbounded, Receiver, Sender};

	struct ChannelListener(Sender<Event>);

	impl FileWatchListener for ChannelListener {
		fn handle_file_action(&self, event: Event) {
			let _ = self.0.send(event);
		}
	}

	fn started_backend() -> (InotifyBackend, Arc<dyn FileWatchListener>, Receiver<Event>) {
		let mut backend = InotifyBackend::new(SymlinkPolicy::shared()).unwrap();
		backend.watch();
		let (tx, rx) = unbounded();
		(backend, Arc::new(ChannelListener(tx)), rx)
	}

	fn wait_for(rx: &Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
		let deadline = Instant::now() + Duration::from_secs(5);
		while Instant::now() < deadline {
			if let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
				if pred(&event) {
					return event;
				}
			}
		}
		panic!("expected event did not arrive within 5s");
	}

	#[test]
	fn create_file_emits_add() {
		let dir = tempfile::tempdir().unwrap();
		let (mut backend, listener, rx) = started_backend();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

		let event = wait_for(&rx, |e| e.action == Action::Add);
		assert_eq!(event.filename, Path::new("a.txt"));
		assert!(event.old_filename.is_none());
	}

	#[test]
	fn rename_pairs_into_single_moved() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("d.txt"), b"x").unwrap();

		let (mut backend, listener, rx) = started_backend();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		std::fs::rename(dir.path().join("d.txt"), dir.path().join("e.txt")).unwrap();

		let event = wait_for(&rx, |e| e.action == Action::Moved);
		assert_eq!(event.filename, Path::new("e.txt"));
		assert_eq!(event.old_filename.as_deref(), Some(Path::new("d.txt")));
	}

	#[test]
	fn move_out_of_watch_becomes_delete_after_timeout() {
		let dir = tempfile::tempdir().unwrap();
		let outside = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("leaving.txt"), b"x").unwrap();

		let (mut backend, listener, rx) = started_backend();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		std::fs::rename(
			dir.path().join("leaving.txt"),
			outside.path().join("gone.txt"),
		)
		.unwrap();

		let event = wait_for(&rx, |e| e.action == Action::Delete);
		assert_eq!(event.filename, Path::new("leaving.txt"));
	}

	#[test]
	fn new_directory_under_recursive_root_is_watched() {
		let dir = tempfile::tempdir().unwrap();
		let (mut backend, listener, rx) = started_backend();
		backend.add_watch(dir.path(), listener, true, &[]).unwrap();

		let sub = dir.path().join("sub");
		std::fs::create_dir(&sub).unwrap();
		wait_for(&rx, |e| e.action == Action::Add && e.filename == Path::new("sub"));

		std::fs::write(sub.join("f.txt"), b"x").unwrap();
		let event = wait_for(&rx, |e| {
			e.action == Action::Add && e.filename == Path::new("f.txt")
		});
		assert_eq!(event.directory, sub.canonicalize().unwrap());
	}

	#[test]
	fn no_events_after_remove_returns() {
		let dir = tempfile::tempdir().unwrap();
		let (mut backend, listener, rx) = started_backend();
		let id = backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		backend.remove_watch_id(id);
		std::fs::write(dir.path().join("late.txt"), b"x").unwrap();

		assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
	}

	#[test]
	fn remote_check_skips_local_tmpdir() {
		let dir = tempfile::tempdir().unwrap();
		assert!(!paths::is_remote_fs(dir.path()));
	}
}
