//! Small filesystem and time helpers shared across the engine.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::sys::stat;
use nix::unistd;

use crate::{Error, Result};

pub mod time;

pub(crate) mod sync {
    //! Poison-recovering lock accessors. A poisoned lock means some thread
    //! panicked while holding it; the engine's locked state is always
    //! consistent at that point (updates happen before or after the guard,
    //! never half-way), so we take the data as-is instead of propagating
    //! the panic.

    use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

    pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rlock<T>(l: &RwLock<T>) -> RwLockReadGuard<T> {
        l.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wlock<T>(l: &RwLock<T>) -> RwLockWriteGuard<T> {
        l.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Atomically replace the contents of `path`.
///
/// The data is written to a `mkstemp` temporary in the same directory and
/// renamed over the target, so readers either see the old or the new file,
/// never a partial write. mkstemp is used because it stays correct across
/// processes and threads.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = unistd::mkstemp(&template)
        .map_err(|err| Error::internal(format!("mkstemp {:?} failed: {}", template, err)))?;

    let tmp_path = tmp_path.as_path();

    let mode = stat::Mode::S_IRUSR
        | stat::Mode::S_IWUSR
        | stat::Mode::S_IRGRP
        | stat::Mode::S_IROTH;

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        return Err(Error::internal(format!("fchmod {:?} failed: {}", tmp_path, err)));
    }

    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        return Err(Error::internal(format!("write {:?} failed: {}", tmp_path, err)));
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        return Err(Error::internal(format!(
            "atomic rename {:?} -> {:?} failed: {}",
            tmp_path, path, err
        )));
    }

    Ok(())
}

/// Open (creating if necessary) and exclusively flock a lock file.
///
/// Returns the open file; the lock is dropped when the file is. Gives up
/// after `timeout_secs`.
pub fn lock_file<P: AsRef<Path>>(path: P, timeout_secs: u64) -> Result<File> {
    use nix::fcntl::{flock, FlockArg};

    let path = path.as_ref();
    let lockfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| Error::internal(format!("unable to open lock {:?} - {}", path, err)))?;

    let fd = lockfile.as_raw_fd();

    let started = std::time::Instant::now();
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(_) => break,
            Err(_) => {
                if started.elapsed().as_secs() >= timeout_secs {
                    return Err(Error::internal(format!(
                        "unable to acquire lock {:?} - got timeout",
                        path
                    )));
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
    }

    Ok(lockfile)
}

/// Hex crc32 of a byte string, used as a cheap content digest for
/// lost-update detection on the configuration file.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    format!("{:08x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.json");

        replace_file(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        replace_file(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // no temporary leftovers
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn lock_file_reacquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let first = lock_file(&path, 1).unwrap();
        drop(first);
        let _second = lock_file(&path, 1).unwrap();
    }
}
