//! End-to-end scenarios forced onto the generic polling backend.
//!
//! The polling backend carries the strictest ordering contract, so these
//! tests also pin down per-cycle ordering and the symlink policy.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use watchdir::{Action, Event, FileWatcher};

fn generic_watcher() -> (FileWatcher, Receiver<Event>, Arc<dyn watchdir::FileWatchListener>) {
	let mut watcher = FileWatcher::new_generic();
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

/// Collects every event that arrives before `window` of quiet passes.
fn collect_quiesced(rx: &Receiver<Event>, window: Duration) -> Vec<Event> {
	let mut events = Vec::new();
	while let Ok(event) = rx.recv_timeout(window) {
		events.push(event);
	}
	events
}

#[test]
fn create_is_reported_within_two_cycles() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = generic_watcher();
	let id = watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::File::create(dir.path().join("a.txt")).unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Add);
	assert_eq!(event.watch_id, id);
	assert_eq!(event.filename, Path::new("a.txt"));
}

#[test]
fn preexisting_entries_produce_no_phantom_adds() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("old1.txt"), b"x").unwrap();
	fs::write(dir.path().join("old2.txt"), b"y").unwrap();

	let (mut watcher, rx, listener) = generic_watcher();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	// Two-plus scan cycles of silence.
	assert!(
		rx.recv_timeout(Duration::from_millis(2500)).is_err(),
		"got a phantom event for a pre-existing entry"
	);
}

#[cfg(unix)]
#[test]
fn rename_is_exactly_one_moved_event() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("d.txt"), b"x").unwrap();

	let (mut watcher, rx, listener) = generic_watcher();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	fs::rename(dir.path().join("d.txt"), dir.path().join("e.txt")).unwrap();

	let event = wait_for(&rx, |e| e.action == Action::Moved);
	assert_eq!(event.filename, Path::new("e.txt"));
	assert_eq!(event.old_filename.as_deref(), Some(Path::new("d.txt")));

	// No stray Delete/Add halves for the same leaves.
	let rest = collect_quiesced(&rx, Duration::from_millis(1500));
	assert!(
		rest.iter().all(|e| {
			e.filename != Path::new("d.txt") && e.filename != Path::new("e.txt")
		}),
		"rename leaked extra events: {rest:?}"
	);
}

#[test]
fn one_cycle_orders_delete_add_modified() {
	let dir = tempfile::tempdir().unwrap();
	fs::write(dir.path().join("doomed.txt"), b"x").unwrap();
	fs::write(dir.path().join("touched.txt"), b"x").unwrap();

	let (mut watcher, rx, listener) = generic_watcher();
	watcher.add_watch(dir.path(), listener, false).unwrap();

	// All three changes land within one scan cycle.
	fs::remove_file(dir.path().join("doomed.txt")).unwrap();
	fs::File::create(dir.path().join("fresh.txt")).unwrap();
	fs::write(dir.path().join("touched.txt"), b"now with more bytes").unwrap();

	let deadline = Instant::now() + Duration::from_secs(5);
	let mut actions = Vec::new();
	while actions.len() < 3 && Instant::now() < deadline {
		if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
			actions.push(event.action);
		}
	}
	assert_eq!(actions, vec![Action::Delete, Action::Add, Action::Modified]);
}

#[test]
fn recursive_watch_reports_subdir_then_contents() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = generic_watcher();
	watcher.add_watch(dir.path(), listener, true).unwrap();

	let sub = dir.path().join("sub");
	fs::create_dir(&sub).unwrap();
	fs::File::create(sub.join("f.txt")).unwrap();

	let first = wait_for(&rx, |e| e.action == Action::Add && e.filename == Path::new("sub"));
	assert_eq!(first.directory, dir.path().canonicalize().unwrap());

	let second = wait_for(&rx, |e| {
		e.action == Action::Add && e.filename == Path::new("f.txt")
	});
	assert_eq!(second.directory, sub.canonicalize().unwrap());
}

#[cfg(unix)]
#[test]
fn symlink_cycle_to_root_is_contained() {
	let dir = tempfile::tempdir().unwrap();
	// T/link -> /  with out-of-scope links disabled: the link must not be
	// entered and the watch must stay functional.
	std::os::unix::fs::symlink("/", dir.path().join("link")).unwrap();

	let (mut watcher, rx, listener) = generic_watcher();
	watcher.follow_symlinks(true);
	assert!(!watcher.allows_out_of_scope_links());

	let id = watcher.add_watch(dir.path(), listener, true).unwrap();
	assert!(id > 0);
	assert_eq!(
		watcher.directories(),
		vec![dir.path().canonicalize().unwrap()]
	);

	// The watcher still observes the root itself.
	fs::File::create(dir.path().join("alive.txt")).unwrap();
	let event = wait_for(&rx, |e| e.action == Action::Add);
	assert_eq!(event.filename, Path::new("alive.txt"));
}

#[test]
fn removed_watch_goes_quiet_before_remove_returns() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, rx, listener) = generic_watcher();
	let id = watcher.add_watch(dir.path(), listener, false).unwrap();

	watcher.remove_watch_id(id);
	fs::File::create(dir.path().join("late.txt")).unwrap();

	assert!(
		rx.recv_timeout(Duration::from_millis(2500)).is_err(),
		"event delivered after remove_watch returned"
	);
}

#[test]
fn teardown_while_worker_is_running() {
	let dir = tempfile::tempdir().unwrap();
	let (mut watcher, _rx, listener) = generic_watcher();
	watcher.add_watch(dir.path(), listener, true).unwrap();
	fs::File::create(dir.path().join("busy.txt")).unwrap();

	// Dropping the watcher stops the worker and joins it; this must not
	// hang or panic.
	drop(watcher);
}
