//! Windows backend on top of overlapped `ReadDirectoryChangesW`.
//!
//! One overlapped read per watch root, all completing on a shared I/O
//! completion port serviced by the worker thread. The kernel supports
//! recursion natively (`bWatchSubtree`), reports rename halves as
//! `RENAMED_OLD_NAME`/`RENAMED_NEW_NAME` pairs inside one buffer, and
//! signals overflow as a zero-length completion, which re-arms the read
//! rather than killing the watch.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use windows_sys::Win32::Foundation::{
	CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
	WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
	FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
	FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
	FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
	FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
	FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
	FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{
	CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus,
	PostQueuedCompletionStatus, OVERLAPPED,
};

use super::{Backend, WatchState, WorkerState};
use crate::config::{self, SymlinkPolicy, WatcherOption};
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::paths;
use crate::registry::Registry;
use crate::FileWatchListener;

/// Default read buffer; network drives reject anything above 64 KiB, which
/// is why the default stays just below it.
const DEFAULT_BUFFER_SIZE: u32 = 63 * 1024;

const DEFAULT_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE
	| FILE_NOTIFY_CHANGE_CREATION
	| FILE_NOTIFY_CHANGE_SECURITY;

/// Completion key that wakes the worker for shutdown.
const WAKE_KEY: usize = 0;

/// Overlapped block plus its read buffer; heap-pinned because the kernel
/// writes into both until the completion is dequeued.
#[repr(C)]
struct IoBlock {
	overlapped: OVERLAPPED,
	buffer: Vec<u8>,
}

struct WinWatch {
	id: WatchId,
	root: PathBuf,
	listener: Arc<dyn FileWatchListener>,
	recursive: bool,
	filter: u32,
	handle: HANDLE,
	io: Box<IoBlock>,
	state: WatchState,
}

// SAFETY: the directory handle is used only by the owning backend and its
// worker, never concurrently.
unsafe impl Send for WinWatch {}

struct WinState {
	registry: Registry<WinWatch>,
	/// Cancelled watches whose final completion has not been dequeued yet;
	/// their buffers must stay alive until then.
	graveyard: HashMap<usize, (HANDLE, Box<IoBlock>)>,
}

struct WinShared {
	state: Mutex<WinState>,
	delivery: Mutex<()>,
	worker_state: WorkerState,
	shutdown: AtomicBool,
	failed: AtomicBool,
	port: HANDLE,
}

// SAFETY: the completion port handle is thread-safe by design.
unsafe impl Send for WinShared {}
unsafe impl Sync for WinShared {}

pub(crate) struct RdcwBackend {
	shared: Arc<WinShared>,
	policy: Arc<SymlinkPolicy>,
	worker: Option<thread::JoinHandle<()>>,
}

impl RdcwBackend {
	pub(crate) fn new(policy: Arc<SymlinkPolicy>) -> Result<Self> {
		// SAFETY: creating an unbound completion port.
		let port = unsafe {
			CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1)
		};
		if port.is_null() {
			return Err(Error::WatcherFailed(format!(
				"CreateIoCompletionPort failed: {}",
				std::io::Error::last_os_error()
			))
			.log());
		}

		Ok(Self {
			shared: Arc::new(WinShared {
				state: Mutex::new(WinState {
					registry: Registry::new(),
					graveyard: HashMap::new(),
				}),
				delivery: Mutex::new(()),
				worker_state: WorkerState::new(),
				shutdown: AtomicBool::new(false),
				failed: AtomicBool::new(false),
				port,
			}),
			policy,
			worker: None,
		})
	}

	fn drain_delivery(&self) {
		drop(self.shared.delivery.lock());
	}

	fn retire(&self, mut watch: WinWatch) {
		// SAFETY: handle is still open; cancellation queues one final
		// completion that the worker uses to free the io block.
		unsafe {
			CancelIoEx(watch.handle, std::ptr::null());
		}
		watch.state = WatchState::Removing;
		let key = &*watch.io as *const IoBlock as usize;
		self.shared
			.state
			.lock()
			.graveyard
			.insert(key, (watch.handle, watch.io));
		self.drain_delivery();
	}
}

impl Backend for RdcwBackend {
	fn add_watch(
		&mut self,
		path: &Path,
		listener: Arc<dyn FileWatchListener>,
		recursive: bool,
		options: &[WatcherOption],
	) -> Result<WatchId> {
		if self.shared.failed.load(Ordering::Acquire) {
			return Err(Error::WatcherFailed("completion port worker is down".into()).log());
		}

		let canonical = paths::resolve_root(path, &self.policy).map_err(Error::log)?;

		if paths::is_remote_fs(&canonical) {
			return Err(Error::FileRemote(canonical).log());
		}

		let mut state = self.shared.state.lock();
		if state.registry.contains_path(&canonical) {
			return Err(Error::FileRepeated(canonical).log());
		}

		let buffer_size = config::win_buffer_size(options).unwrap_or(DEFAULT_BUFFER_SIZE);
		let filter = config::win_notify_filter(options).unwrap_or(DEFAULT_FILTER);

		let handle = open_directory(&canonical)?;
		let io = Box::new(IoBlock {
			// SAFETY: OVERLAPPED is plain old data.
			overlapped: unsafe { std::mem::zeroed() },
			buffer: vec![0u8; buffer_size as usize],
		});

		let id = state
			.registry
			.insert(canonical.clone(), |id| WinWatch {
				id,
				root: canonical.clone(),
				listener,
				recursive,
				filter,
				handle,
				io,
				state: WatchState::Active,
			})
			.map_err(|e| {
				// SAFETY: handle was opened above and is not shared yet.
				unsafe { CloseHandle(handle) };
				e.log()
			})?;

		// Bind the handle to the shared port and arm the first read.
		// SAFETY: both handles are open; the key is the watch id.
		let bound =
			unsafe { CreateIoCompletionPort(handle, self.shared.port, id as usize, 0) };
		if bound.is_null() {
			let watch = state.registry.remove_id(id).expect("just inserted");
			// SAFETY: nothing was armed yet, safe to close immediately.
			unsafe { CloseHandle(watch.handle) };
			return Err(Error::WatcherFailed(format!(
				"binding {} to completion port failed: {}",
				canonical.display(),
				std::io::Error::last_os_error()
			))
			.log());
		}

		let watch = state.registry.get_mut(id).expect("just inserted");
		if let Err(e) = arm_read(watch) {
			let watch = state.registry.remove_id(id).expect("just inserted");
			// SAFETY: the failed read left nothing pending.
			unsafe { CloseHandle(watch.handle) };
			let err = if paths::is_remote_fs(&canonical) {
				Error::FileRemote(canonical)
			} else {
				e
			};
			return Err(err.log());
		}

		debug!(path = %canonical.display(), id, recursive, "added rdcw watch");
		Ok(id)
	}

	fn remove_watch_path(&mut self, path: &Path) {
		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		let removed = self.shared.state.lock().registry.remove_path(&canonical);
		if let Some((id, watch)) = removed {
			self.retire(watch);
			debug!(id, "removed rdcw watch");
		}
	}

	fn remove_watch_id(&mut self, id: WatchId) {
		let removed = self.shared.state.lock().registry.remove_id(id);
		if let Some(watch) = removed {
			self.retire(watch);
			debug!(id, "removed rdcw watch");
		}
	}

	fn watch(&mut self) {
		if !self.shared.worker_state.start() {
			return;
		}

		let shared = self.shared.clone();
		let spawned = thread::Builder::new()
			.name("watchdir-rdcw".into())
			.spawn(move || run_worker(shared));

		match spawned {
			Ok(handle) => self.worker = Some(handle),
			Err(e) => {
				error!("failed to spawn rdcw worker: {e}");
				error::record(&Error::WatcherFailed(format!(
					"failed to spawn rdcw worker: {e}"
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

impl Drop for RdcwBackend {
	fn drop(&mut self) {
		self.shared.worker_state.request_stop();
		self.shared.shutdown.store(true, Ordering::Release);
		// SAFETY: posting a wake packet to a live port.
		unsafe {
			PostQueuedCompletionStatus(self.shared.port, 0, WAKE_KEY, std::ptr::null_mut());
		}
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}

		// Cancel everything still registered, then drain the port briefly
		// so the kernel is done with every buffer before it is freed.
		let ids = self.shared.state.lock().registry.ids();
		for id in ids {
			let removed = self.shared.state.lock().registry.remove_id(id);
			if let Some(watch) = removed {
				self.retire(watch);
			}
		}
		let deadline = Instant::now() + Duration::from_millis(500);
		while Instant::now() < deadline {
			if self.shared.state.lock().graveyard.is_empty() {
				break;
			}
			drain_one(&self.shared, 50);
		}

		let mut state = self.shared.state.lock();
		for (_, (handle, _)) in state.graveyard.drain() {
			// SAFETY: final close of handles we own.
			unsafe { CloseHandle(handle) };
		}
		drop(state);
		// SAFETY: the port is no longer used by any thread.
		unsafe { CloseHandle(self.shared.port) };
	}
}

fn open_directory(dir: &Path) -> Result<HANDLE> {
	let mut wide: Vec<u16> = dir.as_os_str().encode_wide().collect();
	wide.push(0);

	// SAFETY: wide is NUL-terminated; flags request directory + overlapped
	// access.
	let handle = unsafe {
		CreateFileW(
			wide.as_ptr(),
			FILE_LIST_DIRECTORY,
			FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
			std::ptr::null(),
			OPEN_EXISTING,
			FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
			std::ptr::null_mut(),
		)
	};
	if handle == INVALID_HANDLE_VALUE {
		let e = std::io::Error::last_os_error();
		return Err(match e.kind() {
			std::io::ErrorKind::PermissionDenied => Error::FileNotReadable(dir.to_path_buf()),
			std::io::ErrorKind::NotFound => Error::FileNotFound(dir.to_path_buf()),
			_ => Error::WatcherFailed(format!("CreateFileW {}: {e}", dir.display())),
		});
	}
	Ok(handle)
}

/// Issues (or re-issues) the overlapped read for one watch.
fn arm_read(watch: &mut WinWatch) -> Result<()> {
	watch.io.overlapped = unsafe { std::mem::zeroed() };
	let buffer_len = watch.io.buffer.len() as u32;

	// SAFETY: buffer and overlapped live in the heap-pinned IoBlock, which
	// outlives the pending read by construction.
	let ok = unsafe {
		ReadDirectoryChangesW(
			watch.handle,
			watch.io.buffer.as_mut_ptr() as *mut _,
			buffer_len,
			i32::from(watch.recursive),
			watch.filter,
			std::ptr::null_mut(),
			&mut watch.io.overlapped,
			None,
		)
	};
	if ok == 0 {
		let e = std::io::Error::last_os_error();
		return Err(Error::WatcherFailed(format!(
			"ReadDirectoryChangesW {}: {e}",
			watch.root.display()
		)));
	}
	Ok(())
}

fn run_worker(shared: Arc<WinShared>) {
	debug!("rdcw worker started");
	loop {
		if shared.shutdown.load(Ordering::Acquire) {
			break;
		}
		drain_one(&shared, 250);
	}
	shared.worker_state.mark_stopped();
	debug!("rdcw worker stopped");
}

/// Waits for one completion packet and services it.
fn drain_one(shared: &WinShared, timeout_ms: u32) {
	let mut bytes: u32 = 0;
	let mut key: usize = 0;
	let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

	// SAFETY: out-pointers are valid locals; the port outlives the worker.
	let ok = unsafe {
		GetQueuedCompletionStatus(shared.port, &mut bytes, &mut key, &mut overlapped, timeout_ms)
	};

	if overlapped.is_null() {
		// Timeout or wake packet.
		let last = unsafe { GetLastError() };
		if ok == 0 && last != WAIT_TIMEOUT {
			error!("GetQueuedCompletionStatus failed: {last}");
			error::record(&Error::WatcherFailed(format!(
				"completion port wait failed: {last}"
			)));
			shared.failed.store(true, Ordering::Release);
			let mut state = shared.state.lock();
			for (_, watch) in state.registry.iter_mut() {
				watch.state = WatchState::Dead;
			}
		}
		return;
	}

	let _delivery = shared.delivery.lock();
	let mut deliveries: Vec<(Arc<dyn FileWatchListener>, Vec<Event>)> = Vec::new();

	{
		let mut state = shared.state.lock();

		// A completion for a cancelled watch frees its io block.
		let graveyard_key = overlapped as usize;
		if let Some((handle, _io)) = state.graveyard.remove(&graveyard_key) {
			// SAFETY: the kernel is done with this handle's last read.
			unsafe { CloseHandle(handle) };
			return;
		}

		let id = key as WatchId;
		let Some(watch) = state.registry.get_mut(id) else {
			return;
		};
		if watch.state != WatchState::Active {
			return;
		}

		if ok == 0 {
			let last = unsafe { GetLastError() };
			if last == ERROR_OPERATION_ABORTED {
				return;
			}
			warn!(root = %watch.root.display(), "overlapped read failed: {last}");
			error::record(&Error::WatcherFailed(format!(
				"overlapped read failed for {}: {last}",
				watch.root.display()
			)));
			watch.state = WatchState::Removing;
			return;
		}

		if bytes == 0 {
			// Buffer overflow: events were dropped. Not fatal; re-arm and
			// let the caller resynchronize.
			warn!(root = %watch.root.display(), "change buffer overflowed, events lost");
			error::record(&Error::Unspecified(format!(
				"change buffer overflow for {}",
				watch.root.display()
			)));
		} else {
			let events = parse_buffer(watch, bytes as usize);
			if !events.is_empty() {
				deliveries.push((watch.listener.clone(), events));
			}
		}

		if let Err(e) = arm_read(watch) {
			error!(root = %watch.root.display(), "failed to re-arm watch: {e}");
			error::record(&e);
			watch.state = WatchState::Removing;
		}
	}

	for (listener, events) in deliveries {
		for event in events {
			trace!(
				action = event.action.name(),
				directory = %event.directory.display(),
				"rdcw event"
			);
			listener.handle_file_action(event);
		}
	}
}

/// Walks the `FILE_NOTIFY_INFORMATION` chain of one completed read,
/// pairing rename halves that share the buffer.
fn parse_buffer(watch: &WinWatch, len: usize) -> Vec<Event> {
	let mut events = Vec::new();
	let mut rename_old: Option<(PathBuf, PathBuf)> = None;
	let mut offset = 0usize;

	loop {
		if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > len {
			break;
		}
		// SAFETY: offset stays within the len bytes the kernel reported;
		// records are sequentially chained by NextEntryOffset.
		let info = unsafe {
			&*(watch.io.buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION)
		};

		let name_len = info.FileNameLength as usize / 2;
		// SAFETY: FileName is name_len u16s inside the same record.
		let name_slice =
			unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
		let relative = PathBuf::from(OsString::from_wide(name_slice));

		let directory = match relative.parent() {
			Some(parent) if !parent.as_os_str().is_empty() => watch.root.join(parent),
			_ => watch.root.clone(),
		};
		let leaf = relative
			.file_name()
			.map(PathBuf::from)
			.unwrap_or_else(|| relative.clone());

		match info.Action {
			FILE_ACTION_RENAMED_OLD_NAME => {
				rename_old = Some((directory, leaf));
			}
			FILE_ACTION_RENAMED_NEW_NAME => match rename_old.take() {
				Some((old_dir, old_leaf)) if old_dir == directory => {
					events.push(Event::moved(watch.id, directory, leaf, old_leaf));
				}
				Some((old_dir, old_leaf)) => {
					events.push(Event::new(watch.id, old_dir, old_leaf, Action::Delete));
					events.push(Event::new(watch.id, directory, leaf, Action::Add));
				}
				None => {
					events.push(Event::new(watch.id, directory, leaf, Action::Add));
				}
			},
			FILE_ACTION_ADDED => {
				events.push(Event::new(watch.id, directory, leaf, Action::Add));
			}
			FILE_ACTION_REMOVED => {
				events.push(Event::new(watch.id, directory, leaf, Action::Delete));
			}
			FILE_ACTION_MODIFIED => {
				events.push(Event::new(watch.id, directory, leaf, Action::Modified));
			}
			other => {
				trace!(action = other, "unhandled rdcw action");
			}
		}

		if info.NextEntryOffset == 0 {
			break;
		}
		offset += info.NextEntryOffset as usize;
	}

	// An old-name half with no new-name half in the same buffer means the
	// entry moved out of the watched tree.
	if let Some((old_dir, old_leaf)) = rename_old {
		events.push(Event::new(watch.id, old_dir, old_leaf, Action::Delete));
	}

	events
}
