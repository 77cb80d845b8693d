//! Directory snapshots and snapshot diffing.
//!
//! The generic backend synthesizes events by comparing two successive
//! snapshots of one directory; the kqueue backend reuses the same differ to
//! recover leaf names the kernel does not report.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Metadata kept per directory entry, enough to detect modification and to
/// pair renames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryMeta {
	pub(crate) is_dir: bool,
	pub(crate) is_symlink: bool,
	pub(crate) size: u64,
	pub(crate) mtime: Option<SystemTime>,
	/// Inode (or equivalent). `None` where the platform has no stable
	/// notion, in which case renames are never guessed.
	pub(crate) ino: Option<u64>,
}

impl EntryMeta {
	fn from_metadata(meta: &fs::Metadata) -> Self {
		Self {
			is_dir: meta.is_dir(),
			is_symlink: meta.file_type().is_symlink(),
			size: meta.len(),
			mtime: meta.modified().ok(),
			ino: inode(meta),
		}
	}

	fn changed_from(&self, old: &Self) -> bool {
		self.size != old.size || self.mtime != old.mtime || self.is_dir != old.is_dir
	}
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> Option<u64> {
	use std::os::unix::fs::MetadataExt;

	Some(meta.ino())
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> Option<u64> {
	None
}

/// One directory's entries keyed by leaf name.
#[derive(Debug, Default, Clone)]
pub(crate) struct DirSnapshot {
	entries: BTreeMap<OsString, EntryMeta>,
}

/// A change derived from two snapshots of the same directory, already in
/// delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DirChange {
	Deleted { name: OsString, was_dir: bool },
	Renamed { from: OsString, to: OsString, is_dir: bool },
	Added { name: OsString, is_dir: bool },
	Modified { name: OsString },
}

impl DirSnapshot {
	/// A snapshot that reports every current entry as added on the next
	/// diff. Used for directories discovered mid-watch.
	pub(crate) fn empty() -> Self {
		Self::default()
	}

	/// Enumerates `dir` right now.
	///
	/// Entries whose metadata cannot be read (e.g. racing deletions) are
	/// skipped rather than failing the whole scan.
	pub(crate) fn capture(dir: &Path) -> io::Result<Self> {
		let mut entries = BTreeMap::new();
		for entry in fs::read_dir(dir)? {
			let entry = entry?;
			let Ok(meta) = entry.metadata() else {
				continue;
			};
			entries.insert(entry.file_name(), EntryMeta::from_metadata(&meta));
		}
		Ok(Self { entries })
	}

	pub(crate) fn get(&self, name: &std::ffi::OsStr) -> Option<&EntryMeta> {
		self.entries.get(name)
	}

	pub(crate) fn directories(&self) -> impl Iterator<Item = (&OsString, &EntryMeta)> {
		self.entries.iter().filter(|(_, meta)| meta.is_dir || meta.is_symlink)
	}

	/// Diffs `self` (old) against `new`, producing changes ordered
	/// deletions first, then renames, then additions, then modifications.
	///
	/// A deletion and an addition sharing an inode within the same diff
	/// collapse into a single rename.
	pub(crate) fn diff(&self, new: &Self) -> Vec<DirChange> {
		let mut deleted = Vec::new();
		let mut added = Vec::new();
		let mut modified = Vec::new();

		for (name, old_meta) in &self.entries {
			match new.entries.get(name) {
				None => deleted.push((name.clone(), old_meta)),
				Some(new_meta) if new_meta.changed_from(old_meta) => {
					modified.push(name.clone());
				}
				Some(_) => {}
			}
		}

		for (name, new_meta) in &new.entries {
			if !self.entries.contains_key(name) {
				added.push((name.clone(), new_meta));
			}
		}

		let mut changes = Vec::new();
		let mut renames = Vec::new();

		deleted.retain(|(old_name, old_meta)| {
			let Some(ino) = old_meta.ino else {
				return true;
			};
			let Some(pos) = added
				.iter()
				.position(|(_, new_meta)| new_meta.ino == Some(ino))
			else {
				return true;
			};
			let (new_name, new_meta) = added.remove(pos);
			renames.push(DirChange::Renamed {
				from: old_name.clone(),
				to: new_name,
				is_dir: new_meta.is_dir,
			});
			false
		});

		changes.extend(deleted.into_iter().map(|(name, meta)| DirChange::Deleted {
			name,
			was_dir: meta.is_dir,
		}));
		changes.extend(renames);
		changes.extend(added.into_iter().map(|(name, meta)| DirChange::Added {
			name,
			is_dir: meta.is_dir,
		}));
		changes.extend(modified.into_iter().map(|name| DirChange::Modified { name }));

		changes
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn meta(is_dir: bool, size: u64, ino: u64) -> EntryMeta {
		EntryMeta {
			is_dir,
			is_symlink: false,
			size,
			mtime: Some(SystemTime::UNIX_EPOCH),
			ino: Some(ino),
		}
	}

	fn snapshot(entries: &[(&str, EntryMeta)]) -> DirSnapshot {
		DirSnapshot {
			entries: entries
				.iter()
				.map(|(name, meta)| (OsString::from(name), meta.clone()))
				.collect(),
		}
	}

	#[test]
	fn ordering_is_delete_add_modified() {
		let old = snapshot(&[("gone", meta(false, 1, 1)), ("touched", meta(false, 1, 2))]);
		let new = snapshot(&[
			("fresh", meta(false, 1, 3)),
			("touched", meta(false, 9, 2)),
		]);

		let changes = old.diff(&new);
		assert_eq!(
			changes,
			vec![
				DirChange::Deleted {
					name: "gone".into(),
					was_dir: false
				},
				DirChange::Added {
					name: "fresh".into(),
					is_dir: false
				},
				DirChange::Modified {
					name: "touched".into()
				},
			]
		);
	}

	#[test]
	fn rename_collapses_delete_add_pair() {
		let old = snapshot(&[("before.txt", meta(false, 4, 7))]);
		let new = snapshot(&[("after.txt", meta(false, 4, 7))]);

		let changes = old.diff(&new);
		assert_eq!(
			changes,
			vec![DirChange::Renamed {
				from: "before.txt".into(),
				to: "after.txt".into(),
				is_dir: false
			}]
		);
	}

	#[test]
	fn rename_is_never_guessed_without_inodes() {
		let mut before = meta(false, 4, 0);
		before.ino = None;
		let mut after = meta(false, 4, 0);
		after.ino = None;

		let old = snapshot(&[("before.txt", before)]);
		let new = snapshot(&[("after.txt", after)]);

		let changes = old.diff(&new);
		assert_eq!(changes.len(), 2);
		assert!(matches!(changes[0], DirChange::Deleted { .. }));
		assert!(matches!(changes[1], DirChange::Added { .. }));
	}

	#[test]
	fn size_change_is_a_modification() {
		let old = snapshot(&[("file", meta(false, 1, 1))]);
		let new = snapshot(&[("file", meta(false, 2, 1))]);

		assert_eq!(
			old.diff(&new),
			vec![DirChange::Modified {
				name: "file".into()
			}]
		);
	}

	#[test]
	fn identical_snapshots_are_quiet() {
		let snap = snapshot(&[("same", meta(false, 1, 1))]);
		assert!(snap.diff(&snap.clone()).is_empty());
	}
}
