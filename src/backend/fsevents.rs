//! macOS backend on top of FSEvents.
//!
//! FSEvents streams are natively recursive and deliver batched paths with
//! flag sets rather than discrete actions, so the callback reconstructs
//! actions by stat-ing reported paths. Renames arrive as two `ItemRenamed`
//! events (source then destination) that are paired through a one-slot
//! rename stack plus inode comparison, the same trick the kernel forces on
//! every FSEvents consumer.
//!
//! Each watch owns one stream pumped by its own CFRunLoop thread, so
//! callbacks are serialized per watch but not across watches.

#![allow(non_upper_case_globals)]

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{Backend, WorkerState};
use crate::config::{SymlinkPolicy, WatcherOption};
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::paths;
use crate::registry::Registry;
use crate::FileWatchListener;

const STREAM_LATENCY: cf::CFTimeInterval = 0.05;

/// State shared with one stream's callback.
struct StreamContext {
	watch_id: WatchId,
	root: PathBuf,
	listener: Arc<dyn FileWatchListener>,
	recursive: bool,
	active: AtomicBool,
	/// Pending source half of a rename, waiting for its destination.
	rename_from: Mutex<Option<PathBuf>>,
}

impl StreamContext {
	fn deliver(&self, event: Event) {
		if self.active.load(Ordering::Acquire) {
			trace!(
				action = event.action.name(),
				directory = %event.directory.display(),
				"fsevents event"
			);
			self.listener.handle_file_action(event);
		}
	}
}

/// Raw runloop pointer handed between threads so removal can stop the
/// stream's loop.
struct RunLoopHandle(cf::CFRunLoopRef);

// SAFETY: CFRunLoop is internally thread-safe for the stop/wakeup calls we
// make on it.
unsafe impl Send for RunLoopHandle {}
unsafe impl Sync for RunLoopHandle {}

struct FseWatch {
	id: WatchId,
	context: Arc<StreamContext>,
	runloop: Arc<Mutex<Option<RunLoopHandle>>>,
	thread: Option<thread::JoinHandle<()>>,
}

pub(crate) struct FsEventsBackend {
	registry: Mutex<Registry<FseWatch>>,
	state: WorkerState,
	policy: Arc<SymlinkPolicy>,
}

impl FsEventsBackend {
	pub(crate) fn new(policy: Arc<SymlinkPolicy>) -> Self {
		Self {
			registry: Mutex::new(Registry::new()),
			state: WorkerState::new(),
			policy,
		}
	}

	fn stop_watch(watch: &mut FseWatch) {
		watch.context.active.store(false, Ordering::Release);
		if let Some(RunLoopHandle(runloop)) = watch.runloop.lock().take() {
			// SAFETY: the runloop pointer stays valid until the stream
			// thread exits, which only happens after this stop call.
			unsafe { cf::CFRunLoopStop(runloop) };
		}
		if let Some(handle) = watch.thread.take() {
			let _ = handle.join();
		}
	}
}

impl Backend for FsEventsBackend {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		_options: &[WatcherOption],
	) -> Result<WatchId> {
		let canonical = paths::resolve_root(path, &self.policy).map_err(Error::log)?;

		if paths::is_remote_fs(&canonical) {
			return Err(Error::FileRemote(canonical).log());
		}

		let mut registry = self.registry.lock();
		if registry.contains_path(&canonical) {
			return Err(Error::FileRepeated(canonical).log());
		}

		let started = self.state.is_running();
		let id = registry
			.insert(canonical.clone(), |id| FseWatch {
				id,
				context: Arc::new(StreamContext {
					watch_id: id,
					root: canonical.clone(),
					listener,
					recursive,
					active: AtomicBool::new(true),
					rename_from: Mutex::new(None),
				}),
				runloop: Arc::new(Mutex::new(None)),
				thread: None,
			})
			.map_err(Error::log)?;

		if started {
			let watch = registry
				.get_mut(id)
				.unwrap_or_else(|| unreachable!("watch {id} vanished after insert"));
			if let Err(e) = spawn_stream(watch) {
				registry.remove_id(id);
				return Err(e.log());
			}
		}

		debug!(path = %canonical.display(), id, recursive, "added fsevents watch");
		Ok(id)
	}

	fn remove_watch_path(&mut self, path: &Path) {
		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		let removed = self.registry.lock().remove_path(&canonical);
		if let Some((id, mut watch)) = removed {
			Self::stop_watch(&mut watch);
			debug!(id, "removed fsevents watch");
		}
	}

	fn remove_watch_id(&mut self, id: WatchId) {
		let removed = self.registry.lock().remove_id(id);
		if let Some(mut watch) = removed {
			Self::stop_watch(&mut watch);
			debug!(id, "removed fsevents watch");
		}
	}

	fn watch(&mut self) {
		if !self.state.start() {
			return;
		}
		let mut registry = self.registry.lock();
		for (_, watch) in registry.iter_mut() {
			if watch.thread.is_none() {
				if let Err(e) = spawn_stream(watch) {
					error!(id = watch.id, "failed to start fsevents stream: {e}");
					error::record(&e);
					watch.context.active.store(false, Ordering::Release);
				}
			}
		}
	}

	fn directories(&self) -> Vec<PathBuf> {
		self.registry.lock().directories()
	}
}

impl Drop for FsEventsBackend {
	fn drop(&mut self) {
		self.state.request_stop();
		let ids = self.registry.lock().ids();
		for id in ids {
			self.remove_watch_id(id);
		}
		self.state.mark_stopped();
	}
}

/// Spawns the stream thread for one watch; returns once the stream is
/// running (or failed to start).
fn spawn_stream(watch: &mut FseWatch) -> Result<()> {
	let context = watch.context.clone();
	let runloop_slot = watch.runloop.clone();
	let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

	let handle = thread::Builder::new()
		.name("watchdir-fsevents".into())
		.spawn(move || run_stream(context, runloop_slot, ready_tx))
		.map_err(|e| Error::WatcherFailed(format!("failed to spawn fsevents thread: {e}")))?;

	watch.thread = Some(handle);
	match ready_rx.recv() {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => {
			if let Some(handle) = watch.thread.take() {
				let _ = handle.join();
			}
			Err(e)
		}
		Err(_) => Err(Error::WatcherFailed("fsevents thread died during setup".into())),
	}
}

fn run_stream(
	context: Arc<StreamContext>,
	runloop_slot: Arc<Mutex<Option<RunLoopHandle>>>,
	ready_tx: crossbeam_channel::Sender<Result<()>>,
) {
	// The context Arc is handed to the C callback as a raw pointer; its
	// strong count is restored on the way out.
	let info = Arc::into_raw(context.clone()) as *mut c_void;

	let mut stream_context = fs::FSEventStreamContext {
		version: 0,
		info,
		retain: None,
		release: None,
		copy_description: None,
	};

	// SAFETY: all CF objects created here are released before the thread
	// exits; the path string is copied by CFArray.
	unsafe {
		let mut err: cf::CFErrorRef = std::ptr::null_mut();
		let cf_path = cf::str_path_to_cfstring_ref(
			&context.root.to_string_lossy(),
			&mut err,
		);
		if cf_path.is_null() {
			let _ = ready_tx.send(Err(Error::WatcherFailed(format!(
				"cannot represent path for fsevents: {}",
				context.root.display()
			))));
			drop(Arc::from_raw(info as *const StreamContext));
			return;
		}

		let paths = cf::CFArrayCreateMutable(
			cf::kCFAllocatorDefault,
			0,
			&cf::kCFTypeArrayCallBacks,
		);
		cf::CFArrayAppendValue(paths, cf_path);
		cf::CFRelease(cf_path);

		let stream = fs::FSEventStreamCreate(
			cf::kCFAllocatorDefault,
			stream_callback,
			&mut stream_context,
			paths,
			fs::kFSEventStreamEventIdSinceNow,
			STREAM_LATENCY,
			fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
		);
		cf::CFRelease(paths);

		if stream.is_null() {
			let _ = ready_tx.send(Err(Error::WatcherFailed(format!(
				"FSEventStreamCreate failed for {}",
				context.root.display()
			))));
			drop(Arc::from_raw(info as *const StreamContext));
			return;
		}

		let runloop = cf::CFRunLoopGetCurrent();
		*runloop_slot.lock() = Some(RunLoopHandle(runloop));

		fs::FSEventStreamScheduleWithRunLoop(stream, runloop, cf::kCFRunLoopDefaultMode);
		if fs::FSEventStreamStart(stream) == 0 {
			fs::FSEventStreamInvalidate(stream);
			fs::FSEventStreamRelease(stream);
			*runloop_slot.lock() = None;
			let _ = ready_tx.send(Err(Error::WatcherFailed(format!(
				"FSEventStreamStart failed for {}",
				context.root.display()
			))));
			drop(Arc::from_raw(info as *const StreamContext));
			return;
		}

		let _ = ready_tx.send(Ok(()));
		debug!(root = %context.root.display(), "fsevents stream running");

		cf::CFRunLoopRun();

		fs::FSEventStreamStop(stream);
		fs::FSEventStreamInvalidate(stream);
		fs::FSEventStreamRelease(stream);
		drop(Arc::from_raw(info as *const StreamContext));
	}

	debug!("fsevents stream thread stopped");
}

extern "C" fn stream_callback(
	_stream: fs::FSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fs::FSEventStreamEventFlags,
	_event_ids: *const fs::FSEventStreamEventId,
) {
	// SAFETY: info is the Arc<StreamContext> installed at stream creation;
	// the reference is borrowed, not consumed.
	let context = unsafe { &*(info as *const StreamContext) };
	let paths = event_paths as *const *const c_char;

	for i in 0..num_events {
		// SAFETY: FSEvents hands num_events parallel entries of
		// NUL-terminated UTF-8 paths and flag words.
		let (path, flags) = unsafe {
			let raw = *paths.add(i);
			let bytes = CStr::from_ptr(raw).to_bytes();
			use std::os::unix::ffi::OsStrExt;
			(
				PathBuf::from(std::ffi::OsStr::from_bytes(bytes)),
				*event_flags.add(i),
			)
		};
		handle_stream_event(context, path, flags);
	}
}

fn handle_stream_event(context: &StreamContext, path: PathBuf, flags: u32) {
	if flags & fs::kFSEventStreamEventFlagMustScanSubDirs != 0 {
		warn!(root = %context.root.display(), "fsevents dropped events, subtree out of sync");
		error::record(&Error::Unspecified(format!(
			"fsevents coalescing dropped events under {}",
			context.root.display()
		)));
		return;
	}
	if flags
		& (fs::kFSEventStreamEventFlagRootChanged
			| fs::kFSEventStreamEventFlagMount
			| fs::kFSEventStreamEventFlagUnmount)
		!= 0
	{
		return;
	}

	let Some(parent) = path.parent().map(Path::to_path_buf) else {
		return;
	};
	let Some(leaf) = path.file_name().map(PathBuf::from) else {
		return;
	};

	// The stream is recursive by nature; a non-recursive watch only looks
	// at direct children of its root.
	if !context.recursive && parent != context.root {
		return;
	}

	if flags & fs::kFSEventStreamEventFlagItemRenamed != 0 {
		let mut pending = context.rename_from.lock();
		match pending.take() {
			None => {
				if path.exists() {
					// A lone destination: the entry arrived from outside
					// the watched tree.
					context.deliver(Event::new(
						context.watch_id,
						parent,
						leaf,
						Action::Add,
					));
				} else {
					*pending = Some(path);
				}
			}
			Some(from) => {
				let same_parent = from.parent() == Some(parent.as_path());
				if same_parent && path.exists() {
					let old_leaf = from
						.file_name()
						.map(PathBuf::from)
						.unwrap_or_default();
					context.deliver(Event::moved(
						context.watch_id,
						parent,
						leaf,
						old_leaf,
					));
				} else {
					// Source and destination in different directories (or
					// the destination is already gone again): report both
					// halves separately.
					if let (Some(old_parent), Some(old_leaf)) =
						(from.parent(), from.file_name())
					{
						context.deliver(Event::new(
							context.watch_id,
							old_parent.to_path_buf(),
							PathBuf::from(old_leaf),
							Action::Delete,
						));
					}
					if path.exists() {
						context.deliver(Event::new(
							context.watch_id,
							parent,
							leaf,
							Action::Add,
						));
					}
				}
			}
		}
		return;
	}

	let exists = path.exists();
	if flags & fs::kFSEventStreamEventFlagItemRemoved != 0 && !exists {
		context.deliver(Event::new(context.watch_id, parent, leaf, Action::Delete));
	} else if flags & fs::kFSEventStreamEventFlagItemCreated != 0 && exists {
		context.deliver(Event::new(context.watch_id, parent, leaf, Action::Add));
	} else if flags
		& (fs::kFSEventStreamEventFlagItemModified
			| fs::kFSEventStreamEventFlagItemInodeMetaMod
			| fs::kFSEventStreamEventFlagItemChangeOwner)
		!= 0 && exists
	{
		context.deliver(Event::new(
			context.watch_id,
			parent,
			leaf,
			Action::Modified,
		));
	}
}
