//! Error types and the process-wide last-error slot.

use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while registering or running a watch.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// The directory does not exist or is not a directory.
	#[error("directory not found: {0}")]
	FileNotFound(PathBuf),

	/// The directory is already watched under the same canonical path.
	#[error("directory already being watched: {0}")]
	FileRepeated(PathBuf),

	/// A symbolic link points outside the watched scope.
	#[error("symlink out of watch scope: {0}")]
	FileOutOfScope(PathBuf),

	/// The directory exists but cannot be read.
	#[error("directory not readable: {0}")]
	FileNotReadable(PathBuf),

	/// The directory lives on a network filesystem the native backend
	/// cannot watch; use the generic watcher for it.
	#[error("directory on a remote filesystem: {0}")]
	FileRemote(PathBuf),

	/// The platform watch subscription failed.
	#[error("watcher failed: {0}")]
	WatcherFailed(String),

	/// Anything else.
	#[error("{0}")]
	Unspecified(String),
}

impl Error {
	/// The historical numeric code for this error kind.
	///
	/// These are the values `add_watch` used to smuggle through negative
	/// watch ids; they remain stable for callers that key on them.
	pub fn code(&self) -> i64 {
		match self {
			Error::FileNotFound(_) => -1,
			Error::FileRepeated(_) => -2,
			Error::FileOutOfScope(_) => -3,
			Error::FileNotReadable(_) => -4,
			Error::FileRemote(_) => -5,
			Error::WatcherFailed(_) => -6,
			Error::Unspecified(_) => -7,
		}
	}

	/// Records this error in the last-error slot and returns it, so call
	/// sites can `return Err(e.log())` in one breath.
	pub(crate) fn log(self) -> Self {
		record(&self);
		self
	}
}

#[derive(Default)]
struct LastError {
	code: i64,
	message: String,
}

static LAST_ERROR: Mutex<LastError> = Mutex::new(LastError {
	code: 0,
	message: String::new(),
});

/// Stores `error` as the most recent failure.
///
/// Worker threads call this directly for asynchronous failures; synchronous
/// paths go through [`Error::log`].
pub(crate) fn record(error: &Error) {
	let mut slot = LAST_ERROR.lock();
	slot.code = error.code();
	slot.message = error.to_string();
}

/// Code of the most recently recorded error, `0` when none.
pub fn last_error_code() -> i64 {
	LAST_ERROR.lock().code
}

/// Message of the most recently recorded error, empty when none.
pub fn last_error_log() -> String {
	LAST_ERROR.lock().message.clone()
}

/// Resets the last-error slot.
pub fn clear_last_error() {
	let mut slot = LAST_ERROR.lock();
	slot.code = 0;
	slot.message.clear();
}
