//! Path probing helpers shared by the facade and the backends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::SymlinkPolicy;
use crate::error::Error;

/// Validates a prospective watch root and returns its canonical form.
///
/// A root that is itself a symlink is only followed when the policy allows
/// it; otherwise the registration is rejected as out of scope.
pub(crate) fn resolve_root(path: &Path, policy: &SymlinkPolicy) -> Result<PathBuf, Error> {
	let meta = match fs::symlink_metadata(path) {
		Ok(meta) => meta,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			return Err(Error::FileNotFound(path.to_path_buf()));
		}
		Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
			return Err(Error::FileNotReadable(path.to_path_buf()));
		}
		Err(e) => return Err(Error::Unspecified(e.to_string())),
	};

	if meta.file_type().is_symlink() && !policy.follow_symlinks() {
		return Err(Error::FileOutOfScope(path.to_path_buf()));
	}

	let canonical = fs::canonicalize(path)
		.map_err(|e| Error::Unspecified(format!("{}: {e}", path.display())))?;

	if !canonical.is_dir() {
		return Err(Error::FileNotFound(path.to_path_buf()));
	}

	// Probe readability up front so the worker never inherits a root it
	// cannot enumerate.
	if let Err(e) = fs::read_dir(&canonical) {
		return Err(match e.kind() {
			io::ErrorKind::PermissionDenied => Error::FileNotReadable(path.to_path_buf()),
			_ => Error::Unspecified(e.to_string()),
		});
	}

	Ok(canonical)
}

/// Whether a symlinked directory discovered during recursive expansion may
/// be entered, given the canonical watch root and the policy.
pub(crate) fn link_allowed(target: &Path, root: &Path, policy: &SymlinkPolicy) -> bool {
	policy.follow_symlinks() && (policy.allow_out_of_scope() || target.starts_with(root))
}

/// Whether `path` sits on a filesystem type known to be network-backed.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn is_remote_fs(path: &Path) -> bool {
	use std::ffi::CString;
	use std::os::unix::ffi::OsStrExt;

	const NFS_SUPER_MAGIC: i64 = 0x6969;
	const SMB_SUPER_MAGIC: i64 = 0x517b;
	const SMB2_SUPER_MAGIC: i64 = 0xfe53_4d42;
	const CIFS_SUPER_MAGIC: i64 = 0xff53_4d42;

	let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
		return false;
	};

	// SAFETY: statfs only reads the path and writes into the zeroed buf.
	unsafe {
		let mut buf: libc::statfs = std::mem::zeroed();
		if libc::statfs(cpath.as_ptr(), &mut buf) != 0 {
			return false;
		}
		matches!(
			buf.f_type as i64,
			NFS_SUPER_MAGIC | SMB_SUPER_MAGIC | SMB2_SUPER_MAGIC | CIFS_SUPER_MAGIC
		)
	}
}

#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub(crate) fn is_remote_fs(path: &Path) -> bool {
	use std::ffi::{CStr, CString};
	use std::os::unix::ffi::OsStrExt;

	const REMOTE_TYPES: &[&str] = &["nfs", "smbfs", "cifs", "afpfs", "webdav"];

	let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
		return false;
	};

	// SAFETY: statfs only reads the path and writes into the zeroed buf;
	// f_fstypename is a NUL-terminated fixed-size array.
	unsafe {
		let mut buf: libc::statfs = std::mem::zeroed();
		if libc::statfs(cpath.as_ptr(), &mut buf) != 0 {
			return false;
		}
		let name = CStr::from_ptr(buf.f_fstypename.as_ptr());
		let Ok(name) = name.to_str() else {
			return false;
		};
		REMOTE_TYPES.contains(&name)
	}
}

#[cfg(windows)]
pub(crate) fn is_remote_fs(path: &Path) -> bool {
	use std::os::windows::ffi::OsStrExt;

	use windows_sys::Win32::Storage::FileSystem::{GetDriveTypeW, DRIVE_REMOTE};

	// UNC paths are remote by construction.
	let raw = path.as_os_str().encode_wide().collect::<Vec<u16>>();
	if raw.starts_with(&[b'\\' as u16, b'\\' as u16]) {
		return true;
	}

	let Some(root) = path.components().next() else {
		return false;
	};
	let mut root = std::path::PathBuf::from(root.as_os_str())
		.as_os_str()
		.encode_wide()
		.collect::<Vec<u16>>();
	root.extend_from_slice(&[b'\\' as u16, 0]);

	// SAFETY: root is a NUL-terminated wide string.
	unsafe { GetDriveTypeW(root.as_ptr()) == DRIVE_REMOTE }
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn is_remote_fs(_path: &Path) -> bool {
	false
}
