//! End-to-end scenarios against the platform-default backend.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use watchdir::{Action, Error, Event, FileWatcher};

fn watcher_with_channel() -> (FileWatcher, Receiver<Event>, Arc<dyn watchdir::FileWatchListener>)
{
	let mut watcher = FileWatcher::new().expect("failed to create platform watcher");
	watcher.watch();
	let (tx, rx) = unbounded();
	(watcher, rx, Arc::new(tx))
}

fn wait_for(rx: &Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
	let deadline = Instant::now() + Duration::from_secs(5);
	while Instant::now() < deadline {
		if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
			if pred(&event) {
				return event;
			}
		}
	}
	panic!("expected event did not arrive within 5s");
}

#[test]
fn create_file_is_reported_as_add() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = watcher_with_channel();
	let id = watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::File::create(dir.path().join("a.txt")).unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Add);
	assert_eq!(event.watch_id, id);
	assert_eq!(event.filename, Path::new("a.txt"));
	assert!(event.old_filename.is_none());
}

#[test]
fn touch_existing_file_is_reported_as_modified() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("b.txt"), b"before").unwrap();

	let (mut watcher, rx, listener) = watcher_with_channel();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::write(dir.path().join("b.txt"), b"before, but longer now").unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Modified);
	assert_eq!(event.filename, Path::new("b.txt"));
}

#[test]
fn remove_file_is_reported_as_delete() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("c.txt"), b"x").unwrap();

	let (mut watcher, rx, listener) = watcher_with_channel();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::remove_file(dir.path().join("c.txt")).unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Delete);
	assert_eq!(event.filename, Path::new("c.txt"));
}

#[test]
fn rename_in_place_is_one_moved_event() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("d.txt"), b"x").unwrap();

	let (mut watcher, rx, listener) = watcher_with_channel();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::rename(dir.path().join("d.txt"), dir.path().join("e.txt")).unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Moved);
	assert_eq!(event.filename, Path::new("e.txt"));
	assert_eq!(event.old_filename.as_deref(), Some(Path::new("d.txt")));
}

#[test]
fn recursive_watch_follows_new_directories() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = watcher_with_channel();
	watcher.add_watch(dir.path(), listener, true).unwrap();

	let sub = dir.path().join("sub");
	fs::create_dir(&sub).unwrap();
	wait_for(&rx, |e| e.action == Action::Add && e.filename == Path::new("sub"));

	fs::File::create(sub.join("f.txt")).unwrap();
	let event = wait_for(&rx, |e| {
		e.action == Action::Add && e.filename == Path::new("f.txt")
	});
	// Events are re-rooted per subdirectory: the second event's directory
	// is the new subdirectory, and the filename stays a bare leaf.
	assert_eq!(event.directory, sub.canonicalize().unwrap());
}

#[test]
fn duplicate_add_returns_file_repeated() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, _rx, listener) = watcher_with_channel();

	let first = watcher
		.add_watch(dir.path(), listener.clone(), false)
		.unwrap();
	assert!(first > 0);

	watchdir::clear_last_error();
	let err = watcher.add_watch(dir.path(), listener, false).unwrap_err();
	assert!(matches!(err, Error::FileRepeated(_)));
	assert_eq!(watchdir::last_error_code(), -2);

	// The original watch is untouched.
	assert_eq!(
		watcher.directories(),
		vec![dir.path().canonicalize().unwrap()]
	);
}

#[test]
fn ids_are_unique_and_positive() {
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();
	let (mut watcher, _rx, listener) = watcher_with_channel();

	let a = watcher
		.add_watch(dir_a.path(), listener.clone(), false)
		.unwrap();
	let b = watcher.add_watch(dir_b.path(), listener, false).unwrap();

	assert!(a > 0);
	assert!(b > 0);
	assert_ne!(a, b);
}

#[test]
fn no_events_after_remove_watch_returns() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = watcher_with_channel();
	let id = watcher.add_watch(dir.path(), listener, false).unwrap();

	watcher.remove_watch_id(id);

	fs::File::create(dir.path().join("late.txt")).unwrap();
	assert!(
		rx.recv_timeout(Duration::from_secs(2)).is_err(),
		"received an event for a removed watch"
	);
}

#[test]
fn remove_by_path_stops_events_too() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = watcher_with_channel();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	watcher.remove_watch(dir.path());
	assert!(watcher.directories().is_empty());

	fs::File::create(dir.path().join("late.txt")).unwrap();
	assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
}
