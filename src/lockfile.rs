//! UUCP-style advisory device locking
//!
//! Cooperative exclusion against other users of the serial device via the
//! traditional `/var/lock/LCK..<name>` convention: the lockfile holds the
//! owner's PID, and a stale lock (owner no longer running) may be taken
//! over. Environments without a usable lock directory are treated as
//! having exclusive access by policy.

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::constants::LOCK_DIR;
use crate::error::{Error, Result};

/// Outcome of a successful lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Lockfile written; this process owns the device
    Acquired,
    /// Lock directory unusable; locking skipped, device presumed exclusive
    Unsupported,
}

/// A lock directory, normally `/var/lock`. Injectable for tests.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

impl LockDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The system-wide UUCP lock directory
    pub fn system() -> Self {
        Self::new(LOCK_DIR)
    }

    /// Lockfile path for a device: `<dir>/LCK..<basename>`
    pub fn lock_path(&self, devpath: &Path) -> PathBuf {
        let base = devpath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| devpath.to_string_lossy().into_owned());
        self.dir.join(format!("LCK..{}", base))
    }

    /// Acquire the advisory lock for `devpath`.
    ///
    /// A lockfile held by a live process yields `Error::DeviceLocked`; a
    /// stale or unparsable lockfile is unlinked and taken over. If the lock
    /// directory is not accessible for read+write, the attempt succeeds
    /// without writing anything.
    pub fn lock(&self, devpath: &Path) -> Result<LockOutcome> {
        if !access_rw(&self.dir) {
            return Ok(LockOutcome::Unsupported);
        }

        let path = self.lock_path(devpath);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                if let Some(pid) = parse_pid(&contents) {
                    if pid_alive(pid) {
                        return Err(Error::DeviceLocked {
                            path: devpath.to_path_buf(),
                        });
                    }
                }
                // stale lock - take it over
                let _ = fs::remove_file(&path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Lockfile { path, source: e }),
        }

        self.write_record(devpath, &path)?;
        Ok(LockOutcome::Acquired)
    }

    /// Release the lock for `devpath`. Safe to call when none is held.
    pub fn unlock(&self, devpath: &Path) {
        let _ = fs::remove_file(self.lock_path(devpath));
    }

    fn write_record(&self, devpath: &Path, path: &Path) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    // a racer won the exclusive create
                    Error::DeviceLocked {
                        path: devpath.to_path_buf(),
                    }
                } else {
                    Error::Lockfile {
                        path: path.to_path_buf(),
                        source: e,
                    }
                }
            })?;

        let record = format!("{:>10} ip2ser root\n", std::process::id());
        file.write_all(record.as_bytes()).map_err(|e| Error::Lockfile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// First whitespace-delimited token parsed as a PID
fn parse_pid(contents: &str) -> Option<i32> {
    contents
        .split_whitespace()
        .next()
        .and_then(|tok| tok.parse::<i32>().ok())
        .filter(|pid| *pid > 0)
}

/// Null-signal liveness probe. EPERM means the process exists but belongs
/// to someone else, which still counts as alive.
fn pid_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// access(2) probe for read+write permission
pub fn access_rw(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}
