//! Generic polling backend.
//!
//! Works on any filesystem by walking the watched trees on a timer and
//! diffing successive directory snapshots. This is the fallback for network
//! mounts and the reference implementation of the event-ordering contract:
//! within one cycle for one directory, deletions precede additions precede
//! modifications, and a rename surfaces as exactly one `Moved` event.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::{Backend, WatchState, WorkerState};
use crate::config::{SymlinkPolicy, WatcherOption};
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::paths;
use crate::registry::Registry;
use crate::snapshot::{DirChange, DirSnapshot};
use crate::FileWatchListener;

/// Pause between scan cycles.
const SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// One directory in a watch's walk set.
struct WatchedDir {
	/// Canonical identity, used to break symlink cycles.
	canonical: PathBuf,
	snapshot: DirSnapshot,
}

struct PollWatch {
	id: WatchId,
	root: PathBuf,
	listener: Arc<dyn FileWatchListener>,
	recursive: bool,
	state: WatchState,
	/// Walk set: the root plus, for recursive watches, every discovered
	/// descendant directory. Ordered so parents scan before children.
	dirs: BTreeMap<PathBuf, WatchedDir>,
	/// Canonical paths already entered; revisits via symlinks are not
	/// re-entered.
	visited: HashSet<PathBuf>,
}

struct PollShared {
	registry: Mutex<Registry<PollWatch>>,
	/// Held for the whole scan-and-deliver phase of a cycle. `remove_watch`
	/// takes it after deregistering, which makes removal wait out any
	/// in-flight delivery.
	delivery: Mutex<()>,
	state: WorkerState,
	policy: Arc<SymlinkPolicy>,
}

pub(crate) struct PollBackend {
	shared: Arc<PollShared>,
	interval: Duration,
	stop_tx: Sender<()>,
	stop_rx: Option<Receiver<()>>,
	worker: Option<thread::JoinHandle<()>>,
}

impl PollBackend {
	pub(crate) fn new(policy: Arc<SymlinkPolicy>) -> Self {
		Self::with_interval(policy, SCAN_INTERVAL)
	}

	pub(crate) fn with_interval(policy: Arc<SymlinkPolicy>, interval: Duration) -> Self {
		let (stop_tx, stop_rx) = unbounded();
		Self {
			shared: Arc::new(PollShared {
				registry: Mutex::new(Registry::new()),
				delivery: Mutex::new(()),
				state: WorkerState::new(),
				policy,
			}),
			interval,
			stop_tx,
			stop_rx: Some(stop_rx),
			worker: None,
		}
	}

	/// Waits until any in-flight delivery has finished.
	fn drain_delivery(&self) {
		drop(self.shared.delivery.lock());
	}
}

impl Backend for PollBackend {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		_options: &[WatcherOption],
	) -> Result<WatchId> {
		let canonical = paths::resolve_root(path, &self.shared.policy).map_err(Error::log)?;

		if self.shared.registry.lock().contains_path(&canonical) {
			return Err(Error::FileRepeated(canonical).log());
		}

		// Initial snapshots are taken before the call returns so the first
		// cycle does not report pre-existing entries as additions.
		let (dirs, visited) = expand_tree(&canonical, recursive, &self.shared.policy);

		let id = self
			.shared
			.registry
			.lock()
			.insert(canonical.clone(), |id| PollWatch {
				id,
				root: canonical.clone(),
				listener,
				recursive,
				state: WatchState::Active,
				dirs,
				visited,
			})
			.map_err(Error::log)?;

		debug!(path = %canonical.display(), id, recursive, "added polling watch");
		Ok(id)
	}

	fn remove_watch_path(&mut self, path: &Path) {
		let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		let removed = self.shared.registry.lock().remove_path(&canonical);
		if let Some((id, _)) = removed {
			self.drain_delivery();
			debug!(path = %canonical.display(), id, "removed polling watch");
		}
	}

	fn remove_watch_id(&mut self, id: WatchId) {
		let removed = self.shared.registry.lock().remove_id(id);
		if removed.is_some() {
			self.drain_delivery();
			debug!(id, "removed polling watch");
		}
	}

	fn watch(&mut self) {
		if !self.shared.state.start() {
			return;
		}
		let Some(stop_rx) = self.stop_rx.take() else {
			return;
		};

		let shared = self.shared.clone();
		let interval = self.interval;
		let spawned = thread::Builder::new()
			.name("watchdir-poll".into())
			.spawn(move || {
				debug!("polling worker started");
				loop {
					match stop_rx.recv_timeout(interval) {
						Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
						Err(RecvTimeoutError::Timeout) => run_cycle(&shared),
					}
				}
				shared.state.mark_stopped();
				debug!("polling worker stopped");
			});

		match spawned {
			Ok(handle) => self.worker = Some(handle),
			Err(e) => {
				error!("failed to spawn polling worker: {e}");
				error::record(&Error::WatcherFailed(format!(
					"failed to spawn polling worker: {e}"
				)));
				self.shared.state.mark_stopped();
			}
		}
	}

	fn directories(&self) -> Vec<PathBuf> {
		self.shared.registry.lock().directories()
	}
}

impl Drop for PollBackend {
	fn drop(&mut self) {
		self.shared.state.request_stop();
		let _ = self.stop_tx.send(());
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
	}
}

/// One scan-and-deliver pass over every active watch.
///
/// The registry lock covers scanning and snapshot replacement; listener
/// callbacks run after it is released, under the delivery lock only.
fn run_cycle(shared: &PollShared) {
	let _delivery = shared.delivery.lock();

	let mut batches: Vec<(Arc<dyn FileWatchListener>, Vec<Event>)> = Vec::new();
	{
		let mut registry = shared.registry.lock();
		for (_, watch) in registry.iter_mut() {
			if watch.state != WatchState::Active {
				continue;
			}
			let events = scan_watch(watch, &shared.policy);
			if !events.is_empty() {
				batches.push((watch.listener.clone(), events));
			}
		}
	}

	for (listener, events) in batches {
		for event in events {
			trace!(
				action = event.action.name(),
				directory = %event.directory.display(),
				filename = %event.filename.display(),
				"polling event"
			);
			listener.handle_file_action(event);
		}
	}
}

/// Builds the initial walk set for a root: the root itself plus, for
/// recursive watches, every descendant directory reachable under the
/// symlink policy.
fn expand_tree(
	root: &Path,
	recursive: bool,
	policy: &SymlinkPolicy,
) -> (BTreeMap<PathBuf, WatchedDir>, HashSet<PathBuf>) {
	let mut dirs = BTreeMap::new();
	let mut visited = HashSet::new();
	let mut stack = vec![(root.to_path_buf(), root.to_path_buf())];

	while let Some((dir, canonical)) = stack.pop() {
		if !visited.insert(canonical.clone()) {
			continue;
		}
		let snapshot = DirSnapshot::capture(&dir).unwrap_or_else(|_| DirSnapshot::empty());
		if recursive {
			for (name, meta) in snapshot.directories() {
				let child = dir.join(name);
				if let Some(child_canonical) =
					enterable(&child, meta.is_symlink, root, policy)
				{
					stack.push((child, child_canonical));
				}
			}
		}
		dirs.insert(dir, WatchedDir { canonical, snapshot });
	}

	(dirs, visited)
}

/// Canonical identity of a child directory if the walk may enter it.
fn enterable(
	child: &Path,
	is_symlink: bool,
	root: &Path,
	policy: &SymlinkPolicy,
) -> Option<PathBuf> {
	let canonical = fs::canonicalize(child).ok()?;
	if !canonical.is_dir() {
		return None;
	}
	if is_symlink && !paths::link_allowed(&canonical, root, policy) {
		return None;
	}
	Some(canonical)
}

/// Scans every directory of one watch, updating snapshots in place and
/// returning the synthesized events in delivery order.
fn scan_watch(watch: &mut PollWatch, policy: &SymlinkPolicy) -> Vec<Event> {
	let mut events = Vec::new();
	let mut removed_dirs: Vec<PathBuf> = Vec::new();
	let mut renamed_dirs: Vec<(PathBuf, PathBuf)> = Vec::new();
	let mut discovered: Vec<(PathBuf, PathBuf)> = Vec::new();

	let root = watch.root.clone();
	let recursive = watch.recursive;
	let id = watch.id;

	for (dir, watched) in watch.dirs.iter_mut() {
		let new = match DirSnapshot::capture(dir) {
			Ok(snapshot) => snapshot,
			Err(e) => {
				if *dir == root {
					// The watch root itself is gone or unreadable; the
					// watch stops producing events.
					error!(root = %root.display(), "watch root vanished: {e}");
					error::record(&Error::WatcherFailed(format!(
						"watch root vanished: {}",
						root.display()
					)));
					watch.state = WatchState::Removing;
					return Vec::new();
				}
				removed_dirs.push(dir.clone());
				continue;
			}
		};

		for change in watched.snapshot.diff(&new) {
			match change {
				DirChange::Deleted { name, was_dir } => {
					if was_dir {
						removed_dirs.push(dir.join(&name));
					}
					events.push(Event::new(id, dir.clone(), name, Action::Delete));
				}
				DirChange::Renamed { from, to, is_dir } => {
					if is_dir && recursive {
						renamed_dirs.push((dir.join(&from), dir.join(&to)));
					}
					events.push(Event::moved(id, dir.clone(), to, from));
				}
				DirChange::Added { name, is_dir } => {
					if recursive {
						let is_symlink =
							new.get(&name).is_some_and(|meta| meta.is_symlink);
						if is_dir || is_symlink {
							let child = dir.join(&name);
							if let Some(canonical) =
								enterable(&child, is_symlink, &root, policy)
							{
								discovered.push((child, canonical));
							}
						}
					}
					events.push(Event::new(id, dir.clone(), name, Action::Add));
				}
				DirChange::Modified { name } => {
					events.push(Event::new(id, dir.clone(), name, Action::Modified));
				}
			}
		}

		watched.snapshot = new;
	}

	for (from, to) in renamed_dirs {
		rekey_subtree(watch, &from, &to);
	}
	for dir in removed_dirs {
		prune_subtree(watch, &dir);
	}
	for (path, canonical) in discovered {
		// A canonical path already in the walk set (a symlink revisit) is
		// not entered again.
		if watch.visited.insert(canonical.clone()) {
			// New directories start from an empty snapshot; their contents
			// surface as additions on the next cycle.
			watch.dirs.insert(
				path,
				WatchedDir {
					canonical,
					snapshot: DirSnapshot::empty(),
				},
			);
		}
	}

	events
}

/// Drops `dir` and everything under it from the walk set.
fn prune_subtree(watch: &mut PollWatch, dir: &Path) {
	let doomed: Vec<PathBuf> = watch
		.dirs
		.range(dir.to_path_buf()..)
		.take_while(|(path, _)| path.starts_with(dir))
		.map(|(path, _)| path.clone())
		.collect();
	for path in doomed {
		if let Some(watched) = watch.dirs.remove(&path) {
			watch.visited.remove(&watched.canonical);
		}
	}
}

/// Re-keys a renamed directory's subtree so its snapshots survive the move
/// instead of being rediscovered as fresh additions.
fn rekey_subtree(watch: &mut PollWatch, from: &Path, to: &Path) {
	let moved: Vec<PathBuf> = watch
		.dirs
		.range(from.to_path_buf()..)
		.take_while(|(path, _)| path.starts_with(from))
		.map(|(path, _)| path.clone())
		.collect();

	for old_path in moved {
		let Some(mut watched) = watch.dirs.remove(&old_path) else {
			continue;
		};
		watch.visited.remove(&watched.canonical);

		let suffix = old_path
			.strip_prefix(from)
			.unwrap_or_else(|_| Path::new(""));
		let new_path = to.join(suffix);
		watched.canonical = fs::canonicalize(&new_path).unwrap_or_else(|_| new_path.clone());
		watch.visited.insert(watched.canonical.clone());
		watch.dirs.insert(new_path, watched);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Collector(Arc<Mutex<Vec<Event>>>);

	impl FileWatchListener for Collector {
		fn handle_file_action(&self, event: Event) {
			self.0.lock().push(event);
		}
	}

	fn collector() -> (Arc<dyn FileWatchListener>, Arc<Mutex<Vec<Event>>>) {
		let sink = Arc::new(Mutex::new(Vec::new()));
		(Arc::new(Collector(sink.clone())), sink)
	}

	fn backend() -> PollBackend {
		PollBackend::new(SymlinkPolicy::shared())
	}

	fn drain(sink: &Arc<Mutex<Vec<Event>>>) -> Vec<Event> {
		std::mem::take(&mut *sink.lock())
	}

	#[test]
	fn initial_snapshot_suppresses_preexisting_entries() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("already-there.txt"), b"x").unwrap();

		let mut backend = backend();
		let (listener, sink) = collector();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		run_cycle(&backend.shared);
		assert!(drain(&sink).is_empty());
	}

	#[test]
	fn create_modify_delete_sequence() {
		let dir = tempfile::tempdir().unwrap();
		let mut backend = backend();
		let (listener, sink) = collector();
		let id = backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		let file = dir.path().join("a.txt");
		fs::write(&file, b"one").unwrap();
		run_cycle(&backend.shared);
		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Add);
		assert_eq!(events[0].watch_id, id);
		assert_eq!(events[0].filename, Path::new("a.txt"));

		fs::write(&file, b"one and some more").unwrap();
		run_cycle(&backend.shared);
		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Modified);

		fs::remove_file(&file).unwrap();
		run_cycle(&backend.shared);
		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Delete);
	}

	#[test]
	fn cycle_orders_deletes_before_adds_before_modifieds() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("doomed.txt"), b"x").unwrap();
		fs::write(dir.path().join("touched.txt"), b"x").unwrap();

		let mut backend = backend();
		let (listener, sink) = collector();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		fs::remove_file(dir.path().join("doomed.txt")).unwrap();
		fs::write(dir.path().join("fresh.txt"), b"y").unwrap();
		fs::write(dir.path().join("touched.txt"), b"longer than before").unwrap();

		run_cycle(&backend.shared);
		let actions: Vec<Action> = drain(&sink).iter().map(|e| e.action).collect();
		assert_eq!(actions, vec![Action::Delete, Action::Add, Action::Modified]);
	}

	#[cfg(unix)]
	#[test]
	fn rename_in_same_directory_is_one_moved_event() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("d.txt"), b"x").unwrap();

		let mut backend = backend();
		let (listener, sink) = collector();
		backend.add_watch(dir.path(), listener, false, &[]).unwrap();

		fs::rename(dir.path().join("d.txt"), dir.path().join("e.txt")).unwrap();
		run_cycle(&backend.shared);

		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Moved);
		assert_eq!(events[0].filename, Path::new("e.txt"));
		assert_eq!(events[0].old_filename.as_deref(), Some(Path::new("d.txt")));
	}

	#[test]
	fn recursive_watch_discovers_new_directories() {
		let dir = tempfile::tempdir().unwrap();
		let mut backend = backend();
		let (listener, sink) = collector();
		backend.add_watch(dir.path(), listener, true, &[]).unwrap();

		let sub = dir.path().join("sub");
		fs::create_dir(&sub).unwrap();
		run_cycle(&backend.shared);
		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Add);
		assert_eq!(events[0].filename, Path::new("sub"));

		fs::write(sub.join("f.txt"), b"x").unwrap();
		run_cycle(&backend.shared);
		let events = drain(&sink);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].action, Action::Add);
		assert_eq!(events[0].filename, Path::new("f.txt"));
		assert_eq!(events[0].directory, sub.canonicalize().unwrap());
	}

	#[test]
	fn deleted_directory_prunes_descendants() {
		let dir = tempfile::tempdir().unwrap();
		let sub = dir.path().join("sub");
		let nested = sub.join("nested");
		fs::create_dir_all(&nested).unwrap();
		fs::write(nested.join("f.txt"), b"x").unwrap();

		let mut backend = backend();
		let (listener, sink) = collector();
		backend.add_watch(dir.path(), listener, true, &[]).unwrap();

		fs::remove_dir_all(&sub).unwrap();
		run_cycle(&backend.shared);

		let events = drain(&sink);
		// One Delete for the vanished subdirectory leaf; descendants leave
		// the walk set without events of their own.
		assert!(events
			.iter()
			.any(|e| e.action == Action::Delete && e.filename == Path::new("sub")));

		// The next cycle must be quiet: nothing still references the
		// pruned subtree.
		run_cycle(&backend.shared);
		assert!(drain(&sink).is_empty());
	}

	#[cfg(unix)]
	#[test]
	fn symlink_cycle_does_not_expand_forever() {
		let dir = tempfile::tempdir().unwrap();
		let policy = SymlinkPolicy::shared();
		policy.set_follow_symlinks(true);

		// dir/loop -> dir, an immediate cycle.
		std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

		let mut backend = PollBackend::new(policy);
		let (listener, _sink) = collector();
		let id = backend.add_watch(dir.path(), listener, true, &[]).unwrap();

		// The walk set contains the root only; the cycle was not entered.
		let mut registry = backend.shared.registry.lock();
		let watch = registry.get_mut(id).unwrap();
		assert_eq!(watch.dirs.len(), 1);
	}

	#[cfg(unix)]
	#[test]
	fn out_of_scope_symlink_requires_both_flags() {
		let outside = tempfile::tempdir().unwrap();
		fs::write(outside.path().join("secret.txt"), b"x").unwrap();
		let dir = tempfile::tempdir().unwrap();
		std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

		// follow_symlinks alone must not leave the watched subtree.
		let policy = SymlinkPolicy::shared();
		policy.set_follow_symlinks(true);
		let mut backend = PollBackend::new(policy);
		let (listener, _) = collector();
		let id = backend.add_watch(dir.path(), listener, true, &[]).unwrap();
		{
			let mut registry = backend.shared.registry.lock();
			assert_eq!(registry.get_mut(id).unwrap().dirs.len(), 1);
		}

		// With out-of-scope links allowed, the link target joins the walk.
		let policy = SymlinkPolicy::shared();
		policy.set_follow_symlinks(true);
		policy.set_allow_out_of_scope(true);
		let mut backend = PollBackend::new(policy);
		let (listener, _) = collector();
		let id = backend.add_watch(dir.path(), listener, true, &[]).unwrap();
		{
			let mut registry = backend.shared.registry.lock();
			assert_eq!(registry.get_mut(id).unwrap().dirs.len(), 2);
		}
	}

	#[test]
	fn duplicate_watch_is_rejected_and_logged() {
		let dir = tempfile::tempdir().unwrap();
		let mut backend = backend();
		let (listener, _) = collector();
		backend
			.add_watch(dir.path(), listener.clone(), false, &[])
			.unwrap();

		error::clear_last_error();
		let err = backend.add_watch(dir.path(), listener, false, &[]).unwrap_err();
		assert!(matches!(err, Error::FileRepeated(_)));
		assert_eq!(error::last_error_code(), err.code());
	}

	#[test]
	fn remove_by_path_and_id_are_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let mut backend = backend();
		let (listener, sink) = collector();
		let id = backend.add_watch(dir.path(), listener, false, &[]).unwrap();
		assert_eq!(backend.directories().len(), 1);

		backend.remove_watch_id(id);
		assert!(backend.directories().is_empty());
		backend.remove_watch_id(id);
		backend.remove_watch_path(dir.path());

		// No events ever flow for a removed watch.
		fs::write(dir.path().join("late.txt"), b"x").unwrap();
		run_cycle(&backend.shared);
		assert!(drain(&sink).is_empty());
	}
}
