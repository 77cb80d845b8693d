//! BSD backend on top of kqueue.
//!
//! kqueue reports that *something* changed in a directory but never names
//! the entry, so each signal triggers a re-scan of the affected directory
//! and a snapshot diff, exactly like one generic-backend cycle for that
//! directory. File content changes do not touch the parent directory's
//! vnode either, so a periodic sweep fills in `Modified` events.
//!
//! Recursion is emulated with one descriptor per directory, as on Linux.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{Backend, WatchState, WorkerState};
use crate::config::{SymlinkPolicy, WatcherOption};
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::paths;
use crate::registry::Registry;
use crate::snapshot::{DirChange, DirSnapshot};
use crate::FileWatchListener;

/// Periodic sweep that catches file modifications kqueue cannot signal.
const SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

const VNODE_FLAGS: u32 =
	libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_ATTRIB;

struct KqDir {
	fd: RawFd,
	snapshot: DirSnapshot,
}

struct KqueueWatch {
	id: WatchId,
	root: PathBuf,
	listener: Arc<dyn FileWatchListener>,
	recursive: bool,
	state: WatchState,
	dirs: BTreeMap<PathBuf, KqDir>,
	visited: HashSet<PathBuf>,
}

struct KqueueState {
	registry: Registry<KqueueWatch>,
	/// Descriptor index back to the owning watch and directory.
	fds: HashMap<RawFd, (WatchId, PathBuf)>,
}

struct KqueueShared {
	state: Mutex<KqueueState>,
	delivery: Mutex<()>,
	worker_state: WorkerState,
	policy: Arc<SymlinkPolicy>,
	shutdown: AtomicBool,
	failed: AtomicBool,
	kq: RawFd,
}

pub(crate) struct KqueueBackend {
	shared: Arc<KqueueShared>,
	worker: Option<thread::JoinHandle<()>>,
}

impl KqueueBackend {
	pub(crate) fn new(policy: Arc<SymlinkPolicy>) -> Result<Self> {
		// SAFETY: plain descriptor creation.
		let kq = unsafe { libc::kqueue() };
		if kq < 0 {
			let e = io::Error::last_os_error();
			return Err(Error::WatcherFailed(format!("kqueue init failed: {e}")).log());
		}

		Ok(Self {
			shared: Arc::new(KqueueShared {
				state: Mutex::new(KqueueState {
					registry: Registry::new(),
					fds: HashMap::new(),
				}),
				delivery: Mutex::new(()),
				worker_state: WorkerState::new(),
				policy,
				shutdown: AtomicBool::new(false),
				failed: AtomicBool::new(false),
				kq,
			}),
			worker: None,
		})
	}

	fn drain_delivery(&self) {
		drop(self.shared.delivery.lock());
	}
}

impl Backend for KqueueBackend {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		_options: &[WatcherOption],
	) -> Result<WatchId> {
		if self.shared.failed.load(Ordering::Acquire) {
			return Err(Error::WatcherFailed("kqueue worker is down".into()).log());
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
			.insert(canonical.clone(), |id| KqueueWatch {
				id,
				root: canonical.clone(),
				listener,
				recursive,
				state: WatchState::Active,
				dirs: BTreeMap::new(),
				visited: HashSet::new(),
			})
			.map_err(Error::log)?;

		if let Err(e) = install_tree(&self.shared, &mut state, id, &canonical, &canonical) {
			let fds = detach_fds(&mut state, id);
			state.registry.remove_id(id);
			close_fds(&fds);
			return Err(e.log());
		}

		debug!(path = %canonical.display(), id, recursive, "added kqueue watch");
		Ok(id)
	}

	fn remove_watch_path(&mut self, path: &Path) {
		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		let removed = {
			let mut state = self.shared.state.lock();
			state
				.registry
				.remove_path(&canonical)
				.map(|(id, _)| detach_fds(&mut state, id))
		};
		if let Some(fds) = removed {
			close_fds(&fds);
			self.drain_delivery();
			debug!(path = %canonical.display(), "removed kqueue watch");
		}
	}

	fn remove_watch_id(&mut self, id: WatchId) {
		let removed = {
			let mut state = self.shared.state.lock();
			state
				.registry
				.remove_id(id)
				.map(|_| detach_fds(&mut state, id))
		};
		if let Some(fds) = removed {
			close_fds(&fds);
			self.drain_delivery();
			debug!(id, "removed kqueue watch");
		}
	}

	fn watch(&mut self) {
		if !self.shared.worker_state.start() {
			return;
		}

		let shared = self.shared.clone();
		let spawned = thread::Builder::new()
			.name("watchdir-kqueue".into())
			.spawn(move || run_worker(shared));

		match spawned {
			Ok(handle) => self.worker = Some(handle),
			Err(e) => {
				error!("failed to spawn kqueue worker: {e}");
				error::record(&Error::WatcherFailed(format!(
					"failed to spawn kqueue worker: {e}"
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

impl Drop for KqueueBackend {
	fn drop(&mut self) {
		self.shared.worker_state.request_stop();
		self.shared.shutdown.store(true, Ordering::Release);
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}

		let mut state = self.shared.state.lock();
		let fds: Vec<RawFd> = state.fds.keys().copied().collect();
		state.fds.clear();
		close_fds(&fds);
		// SAFETY: kq is a descriptor this backend owns exclusively.
		unsafe { libc::close(self.shared.kq) };
	}
}

/// Opens and registers a vnode descriptor for one directory.
fn register_dir(kq: RawFd, dir: &Path) -> Result<RawFd> {
	let cpath = CString::new(dir.as_os_str().as_bytes())
		.map_err(|_| Error::Unspecified(format!("path contains NUL: {}", dir.display())))?;

	// SAFETY: cpath is NUL-terminated; the descriptor is checked below.
	let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
	if fd < 0 {
		let e = io::Error::last_os_error();
		return Err(match e.kind() {
			io::ErrorKind::PermissionDenied => Error::FileNotReadable(dir.to_path_buf()),
			io::ErrorKind::NotFound => Error::FileNotFound(dir.to_path_buf()),
			_ => Error::WatcherFailed(format!("open {}: {e}", dir.display())),
		});
	}

	// SAFETY: kevent is plain old data; zeroing sidesteps the per-BSD
	// differences in the udata field's type.
	let mut change: libc::kevent = unsafe { std::mem::zeroed() };
	change.ident = fd as usize;
	change.filter = libc::EVFILT_VNODE;
	change.flags = libc::EV_ADD | libc::EV_CLEAR;
	change.fflags = VNODE_FLAGS;
	// SAFETY: change points at one initialized kevent; no output events
	// are requested.
	let rc = unsafe {
		libc::kevent(
			kq,
			&mut change,
			1,
			std::ptr::null_mut(),
			0,
			std::ptr::null(),
		)
	};
	if rc < 0 {
		let e = io::Error::last_os_error();
		// SAFETY: fd was opened above and not shared yet.
		unsafe { libc::close(fd) };
		return Err(Error::WatcherFailed(format!(
			"kevent register {}: {e}",
			dir.display()
		)));
	}

	Ok(fd)
}

/// Registers `dir` and, for recursive watches, its descendants; takes the
/// initial snapshots so pre-existing entries stay silent.
fn install_tree(
	shared: &KqueueShared,
	state: &mut KqueueState,
	watch_id: WatchId,
	root: &Path,
	dir: &Path,
) -> Result<()> {
	let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
	{
		let Some(watch) = state.registry.get_mut(watch_id) else {
			return Ok(());
		};
		if !watch.visited.insert(canonical) {
			return Ok(());
		}
	}

	let fd = register_dir(shared.kq, dir)?;
	let snapshot = DirSnapshot::capture(dir).unwrap_or_else(|_| DirSnapshot::empty());
	state.fds.insert(fd, (watch_id, dir.to_path_buf()));

	let (recursive, children) = {
		let Some(watch) = state.registry.get_mut(watch_id) else {
			return Ok(());
		};
		let children: Vec<(PathBuf, bool)> = snapshot
			.directories()
			.map(|(name, meta)| (dir.join(name), meta.is_symlink))
			.collect();
		watch.dirs.insert(dir.to_path_buf(), KqDir { fd, snapshot });
		(watch.recursive, children)
	};

	if !recursive {
		return Ok(());
	}

	for (child, is_symlink) in children {
		let enter = if is_symlink {
			std::fs::canonicalize(&child)
				.map(|target| {
					target.is_dir() && paths::link_allowed(&target, root, &shared.policy)
				})
				.unwrap_or(false)
		} else {
			true
		};
		if enter {
			if let Err(e) = install_tree(shared, state, watch_id, root, &child) {
				warn!(dir = %child.display(), "skipping unwatchable subdirectory: {e}");
			}
		}
	}

	Ok(())
}

fn detach_fds(state: &mut KqueueState, watch_id: WatchId) -> Vec<RawFd> {
	let fds: Vec<RawFd> = state
		.fds
		.iter()
		.filter(|(_, (id, _))| *id == watch_id)
		.map(|(fd, _)| *fd)
		.collect();
	for fd in &fds {
		state.fds.remove(fd);
	}
	fds
}

fn close_fds(fds: &[RawFd]) {
	for fd in fds {
		// SAFETY: descriptors were opened by register_dir and removed from
		// every index before closing. Closing also drops the kevent.
		unsafe { libc::close(*fd) };
	}
}

fn run_worker(shared: Arc<KqueueShared>) {
	debug!("kqueue worker started");
	let mut last_sweep = Instant::now();

	loop {
		if shared.shutdown.load(Ordering::Acquire) {
			break;
		}

		let timeout = libc::timespec {
			tv_sec: 0,
			tv_nsec: 250_000_000,
		};
		let mut events: [libc::kevent; 64] = unsafe { std::mem::zeroed() };
		// SAFETY: events has room for the requested count; timeout is a
		// valid timespec.
		let count = unsafe {
			libc::kevent(
				shared.kq,
				std::ptr::null(),
				0,
				events.as_mut_ptr(),
				events.len() as i32,
				&timeout,
			)
		};
		if count < 0 {
			let e = io::Error::last_os_error();
			if e.kind() == io::ErrorKind::Interrupted {
				continue;
			}
			error!("kevent wait failed: {e}");
			error::record(&Error::WatcherFailed(format!("kevent wait failed: {e}")));
			shared.failed.store(true, Ordering::Release);
			let mut state = shared.state.lock();
			for (_, watch) in state.registry.iter_mut() {
				watch.state = WatchState::Dead;
			}
			break;
		}

		let mut touched: Vec<(WatchId, PathBuf, u32)> = Vec::new();
		if count > 0 {
			let state = shared.state.lock();
			for event in events.iter().take(count as usize) {
				let fd = event.ident as RawFd;
				if let Some((watch_id, dir)) = state.fds.get(&fd) {
					touched.push((*watch_id, dir.clone(), event.fflags));
				}
			}
		}

		let sweep = last_sweep.elapsed() >= SWEEP_INTERVAL;
		if sweep {
			last_sweep = Instant::now();
		}

		if !touched.is_empty() || sweep {
			run_pass(&shared, &touched, sweep);
		}
	}

	shared.worker_state.mark_stopped();
	debug!("kqueue worker stopped");
}

/// Re-scans signalled directories (and, on sweep passes, every directory)
/// and delivers the resulting diffs.
fn run_pass(shared: &KqueueShared, touched: &[(WatchId, PathBuf, u32)], sweep: bool) {
	let _delivery = shared.delivery.lock();
	let mut batches: Vec<(Arc<dyn FileWatchListener>, Vec<Event>)> = Vec::new();

	{
		let mut state = shared.state.lock();

		// Root vnodes deleted or renamed end their watch.
		for (watch_id, dir, fflags) in touched {
			if fflags & (libc::NOTE_DELETE | libc::NOTE_RENAME) != 0 {
				if let Some(watch) = state.registry.get_mut(*watch_id) {
					if watch.state == WatchState::Active && *dir == watch.root {
						warn!(root = %watch.root.display(), "watch root deleted or renamed");
						error::record(&Error::WatcherFailed(format!(
							"watch root deleted or renamed: {}",
							watch.root.display()
						)));
						watch.state = WatchState::Removing;
					}
				}
			}
		}

		let ids = state.registry.ids();
		for id in ids {
			let dirty: Vec<PathBuf> = if sweep {
				Vec::new()
			} else {
				touched
					.iter()
					.filter(|(watch_id, _, _)| *watch_id == id)
					.map(|(_, dir, _)| dir.clone())
					.collect()
			};
			if !sweep && dirty.is_empty() {
				continue;
			}

			let events = rescan_watch(shared, &mut state, id, &dirty, sweep);
			if events.is_empty() {
				continue;
			}
			if let Some(watch) = state.registry.get_mut(id) {
				batches.push((watch.listener.clone(), events));
			}
		}
	}

	for (listener, events) in batches {
		for event in events {
			trace!(
				action = event.action.name(),
				directory = %event.directory.display(),
				"kqueue event"
			);
			listener.handle_file_action(event);
		}
	}
}

/// Diffs the given directories of one watch (all of them on sweep passes),
/// applying walk-set updates for added, deleted, and renamed directories.
fn rescan_watch(
	shared: &KqueueShared,
	state: &mut KqueueState,
	id: WatchId,
	dirty: &[PathBuf],
	sweep: bool,
) -> Vec<Event> {
	let mut events = Vec::new();
	let mut removed_dirs: Vec<PathBuf> = Vec::new();
	let mut renamed_dirs: Vec<(PathBuf, PathBuf)> = Vec::new();
	let mut discovered: Vec<PathBuf> = Vec::new();

	let (root, recursive) = {
		let Some(watch) = state.registry.get_mut(id) else {
			return events;
		};
		if watch.state != WatchState::Active {
			return events;
		}
		(watch.root.clone(), watch.recursive)
	};

	{
		let Some(watch) = state.registry.get_mut(id) else {
			return events;
		};

		for (dir, kq_dir) in watch.dirs.iter_mut() {
			if !sweep && !dirty.contains(dir) {
				continue;
			}

			let new = match DirSnapshot::capture(dir) {
				Ok(snapshot) => snapshot,
				Err(_) => {
					removed_dirs.push(dir.clone());
					continue;
				}
			};

			for change in kq_dir.snapshot.diff(&new) {
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
								discovered.push(dir.join(&name));
							}
						}
						events.push(Event::new(id, dir.clone(), name, Action::Add));
					}
					DirChange::Modified { name } => {
						events.push(Event::new(id, dir.clone(), name, Action::Modified));
					}
				}
			}

			kq_dir.snapshot = new;
		}

		for (from, to) in renamed_dirs {
			let moved: Vec<PathBuf> = watch
				.dirs
				.range(from.clone()..)
				.take_while(|(path, _)| path.starts_with(&from))
				.map(|(path, _)| path.clone())
				.collect();
			for old_path in moved {
				if let Some(kq_dir) = watch.dirs.remove(&old_path) {
					let suffix = old_path
						.strip_prefix(&from)
						.unwrap_or_else(|_| Path::new(""));
					let new_path = to.join(suffix);
					if let Some(entry) = state.fds.get_mut(&kq_dir.fd) {
						entry.1 = new_path.clone();
					}
					watch.dirs.insert(new_path, kq_dir);
				}
			}
		}

		for dir in removed_dirs {
			let doomed: Vec<PathBuf> = watch
				.dirs
				.range(dir.clone()..)
				.take_while(|(path, _)| path.starts_with(&dir))
				.map(|(path, _)| path.clone())
				.collect();
			for path in doomed {
				if let Some(kq_dir) = watch.dirs.remove(&path) {
					state.fds.remove(&kq_dir.fd);
					close_fds(&[kq_dir.fd]);
					let canonical =
						std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
					watch.visited.remove(&canonical);
				}
			}
		}
	}

	// Newly appeared directories get descriptors and synthesize additions
	// for anything already inside them.
	for child in discovered {
		if let Err(e) = install_tree(shared, state, id, &root, &child) {
			warn!(dir = %child.display(), "failed to watch new subdirectory: {e}");
			continue;
		}
		if let Some(watch) = state.registry.get_mut(id) {
			if let Some(kq_dir) = watch.dirs.get(&child) {
				let empty = DirSnapshot::empty();
				for change in empty.diff(&kq_dir.snapshot) {
					if let DirChange::Added { name, .. } = change {
						events.push(Event::new(id, child.clone(), name, Action::Add));
					}
				}
			}
		}
	}

	events
}
