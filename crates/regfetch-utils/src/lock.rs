//! Per-key locking primitives.
//!
//! [`KeyedLock`] serializes threads of one process that work on the same key,
//! and [`FileLock`] does the same across processes through `flock` on a
//! `<key>.lock` file. Holding both gives a single writer per key.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, PoisonError},
};

use crate::{
    error::{LockError, LockResult},
    fs::ensure_dir_exists,
};

/// Replaces everything outside `[A-Za-z0-9._-]` so any key maps to a valid filename.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A file-based lock using `flock`.
///
/// The lock is released when `FileLock` is dropped.
pub struct FileLock {
    _file: nix::fcntl::Flock<File>,
    path: PathBuf,
}

impl FileLock {
    fn open(dir: &Path, key: &str) -> LockResult<(File, PathBuf)> {
        ensure_dir_exists(dir).map_err(|err| LockError::AcquireFailed(err.to_string()))?;
        let path = dir.join(format!("{}.lock", sanitize(key)));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| {
                LockError::Io {
                    path: path.clone(),
                    source,
                }
            })?;

        Ok((file, path))
    }

    /// Acquire an exclusive lock for `key` inside `dir`, blocking until it is free.
    pub fn acquire(dir: &Path, key: &str) -> LockResult<Self> {
        let (file, path) = Self::open(dir, key)?;

        let file = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(
            |(_, err)| LockError::AcquireFailed(format!("{}: {}", path.display(), err)),
        )?;

        Ok(FileLock {
            _file: file,
            path,
        })
    }

    /// Try to acquire an exclusive lock without blocking.
    ///
    /// Returns `None` if another holder has it.
    pub fn try_acquire(dir: &Path, key: &str) -> LockResult<Option<Self>> {
        let (file, path) = Self::open(dir, key)?;

        match nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                Ok(Some(FileLock {
                    _file: file,
                    path,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, err)) => {
                Err(LockError::AcquireFailed(format!(
                    "{}: {}",
                    path.display(),
                    err
                )))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// In-process mutual exclusion keyed by string.
///
/// Unlike a map of mutexes, released keys leave nothing behind.
#[derive(Default)]
pub struct KeyedLock {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other guard for `key` is alive, then returns one.
    pub fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.to_string());

        KeyedGuard {
            owner: self,
            key: key.to_string(),
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedLock,
    key: String,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .owner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        self.owner.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_lock_path_sanitization() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::acquire(dir.path(), "sha256:abc/def").unwrap();
        assert!(lock
            .path()
            .to_string_lossy()
            .ends_with("sha256_abc_def.lock"));
    }

    #[test]
    fn test_exclusive_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock1 = FileLock::acquire(dir.path(), "blob").unwrap();

        let lock2 = FileLock::try_acquire(dir.path(), "blob").unwrap();
        assert!(lock2.is_none(), "Should not be able to acquire lock");

        drop(lock1);

        let lock3 = FileLock::try_acquire(dir.path(), "blob").unwrap();
        assert!(lock3.is_some(), "Should acquire lock after release");
    }

    #[test]
    fn test_different_keys_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLock::acquire(dir.path(), "a").unwrap();
        let b = FileLock::try_acquire(dir.path(), "b").unwrap();
        assert!(b.is_some());
        assert_ne!(a.path(), b.unwrap().path());
    }

    #[test]
    fn test_file_lock_blocks_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let lock1 = FileLock::acquire(&root, "wait").unwrap();

        let handle = thread::spawn(move || {
            let lock2 = FileLock::acquire(&root, "wait").unwrap();
            lock2.path().to_path_buf()
        });

        thread::sleep(Duration::from_millis(100));
        let expected = lock1.path().to_path_buf();
        drop(lock1);

        assert_eq!(handle.join().unwrap(), expected);
    }

    #[test]
    fn test_keyed_lock_serializes_same_key() {
        let lock = Arc::new(KeyedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = lock.acquire("same");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held("same"));
    }

    #[test]
    fn test_keyed_lock_independent_keys() {
        let lock = KeyedLock::new();
        let _a = lock.acquire("a");
        let _b = lock.acquire("b");
        assert!(lock.is_held("a"));
        assert!(lock.is_held("b"));
    }
}
