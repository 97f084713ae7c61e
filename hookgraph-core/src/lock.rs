//! Advisory per-session sync locks
//!
//! A sync run for a session holds an exclusive `flock` on a file under
//! `$XDG_RUNTIME_DIR/hookgraph/` (temp dir fallback). The file name is
//! scoped by database path and session, so runs against different
//! databases never contend. A busy lock means another run is already
//! projecting the session.

use crate::error::Result;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Held for the duration of one session's sync
#[derive(Debug)]
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

impl SyncLock {
    /// Take the lock, or `None` if another process holds it.
    pub fn try_acquire(db_path: &Path, session_id: &str) -> Result<Option<Self>> {
        Self::try_acquire_in(&lock_dir(), db_path, session_id)
    }

    /// As [`SyncLock::try_acquire`], with an explicit lock directory.
    pub fn try_acquire_in(dir: &Path, db_path: &Path, session_id: &str) -> Result<Option<Self>> {
        fs::create_dir_all(dir)?;

        let path = dir.join(scoped_lock_filename(db_path, session_id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match lock_file_nonblocking(&file) {
            Ok(()) => {
                // Owner info for debugging
                let _ = file.set_len(0);
                let _ = file.seek(SeekFrom::Start(0));
                let _ = writeln!(file, "pid={} session={}", std::process::id(), session_id);
                let _ = file.flush();

                Ok(Some(Self { file, path }))
            }
            Err(e) if is_lock_busy(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("hookgraph");
    dir
}

fn scoped_lock_filename(db_path: &Path, session_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    session_id.hash(&mut hasher);
    let digest = hasher.finish();
    format!("sync.{digest:016x}.lock")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: valid descriptor, constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: valid descriptor, constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("hookgraph sync locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = Path::new("/tmp/hookgraph-test.db");

        let held = SyncLock::try_acquire_in(dir.path(), db, "s1").unwrap();
        assert!(held.is_some());
        // flock is per open file description, so a second open contends
        assert!(SyncLock::try_acquire_in(dir.path(), db, "s1").unwrap().is_none());
        assert!(SyncLock::try_acquire_in(dir.path(), db, "s2").unwrap().is_some());

        drop(held);
        assert!(SyncLock::try_acquire_in(dir.path(), db, "s1").unwrap().is_some());
    }

    #[test]
    fn test_filename_scoped_by_database() {
        let a = scoped_lock_filename(Path::new("/a.db"), "s1");
        let b = scoped_lock_filename(Path::new("/b.db"), "s1");
        assert_ne!(a, b);
    }
}
