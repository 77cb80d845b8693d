//! Normalized filesystem change events.
//!
//! Every backend, no matter how the kernel reports changes, emits the same
//! `Event` record: the watch that observed it, the directory the change
//! happened in, the bare leaf name, and what happened to it.

use std::path::PathBuf;

/// Identifier of a watch registration.
///
/// Successful registrations yield positive ids, allocated monotonically and
/// never reused within one `FileWatcher`. Zero is invalid. Negative values
/// mirror [`crate::Error::code`] for callers that still want the historical
/// error encoding.
pub type WatchId = i64;

/// What happened to a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Action {
	/// An entry appeared.
	Add = 1,
	/// An entry disappeared.
	Delete = 2,
	/// An entry's size or timestamps changed.
	Modified = 3,
	/// An entry was renamed within the same parent directory.
	Moved = 4,
}

impl Action {
	/// Stable human-readable name, for logging sinks.
	pub fn name(self) -> &'static str {
		match self {
			Action::Add => "Add",
			Action::Delete => "Delete",
			Action::Modified => "Modified",
			Action::Moved => "Moved",
		}
	}
}

/// A single normalized change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	/// The watch this event belongs to.
	pub watch_id: WatchId,
	/// Directory the change happened in. For recursive watches this is the
	/// parent of the changed entry, not necessarily the watch root.
	pub directory: PathBuf,
	/// Bare leaf name of the changed entry, relative to `directory`.
	pub filename: PathBuf,
	/// What happened.
	pub action: Action,
	/// Previous leaf name; populated only for [`Action::Moved`].
	pub old_filename: Option<PathBuf>,
}

impl Event {
	pub(crate) fn new(
		watch_id: WatchId,
		directory: impl Into<PathBuf>,
		filename: impl Into<PathBuf>,
		action: Action,
	) -> Self {
		Self {
			watch_id,
			directory: directory.into(),
			filename: filename.into(),
			action,
			old_filename: None,
		}
	}

	pub(crate) fn moved(
		watch_id: WatchId,
		directory: impl Into<PathBuf>,
		filename: impl Into<PathBuf>,
		old_filename: impl Into<PathBuf>,
	) -> Self {
		Self {
			watch_id,
			directory: directory.into(),
			filename: filename.into(),
			action: Action::Moved,
			old_filename: Some(old_filename.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn action_values_are_stable() {
		assert_eq!(Action::Add as i32, 1);
		assert_eq!(Action::Delete as i32, 2);
		assert_eq!(Action::Modified as i32, 3);
		assert_eq!(Action::Moved as i32, 4);
	}

	#[test]
	fn moved_carries_old_name() {
		let event = Event::moved(1, "/tmp", "new.txt", "old.txt");
		assert_eq!(event.action, Action::Moved);
		assert_eq!(event.old_filename.as_deref(), Some(std::path::Path::new("old.txt")));
	}
}
