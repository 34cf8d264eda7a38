use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::{FileSystemError, FileSystemResult};

/// Creates a directory and its parents unless it already exists.
///
/// # Errors
///
/// * [`FileSystemError::Directory`] if the directory could not be created.
/// * [`FileSystemError::NotADirectory`] if the path exists but is not a directory.
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path).map_err(|err| {
            FileSystemError::Directory {
                path: path.to_path_buf(),
                action: "create",
                source: err,
            }
        })?;
    } else if !path.is_dir() {
        return Err(FileSystemError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

/// Returns the size of a regular file, or `None` if nothing exists at `path`.
pub fn regular_file_size<P: AsRef<Path>>(path: P) -> FileSystemResult<Option<u64>> {
    let path = path.as_ref();
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(FileSystemError::File {
                path: path.to_path_buf(),
                action: "stat",
                source: err,
            })
        }
    }
}

/// Copies `src` to `dest` so that `dest` only ever appears complete.
///
/// The data goes to a hidden sibling of `dest` first, is flushed to disk,
/// and is then renamed over `dest`. On failure the sibling is removed.
pub fn atomic_copy<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dest: Q) -> FileSystemResult<u64> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir_exists(parent)?;
    }

    let staging = staging_path(dest);
    let copied = copy_and_sync(src, &staging).and_then(|n| fs::rename(&staging, dest).map(|_| n));

    copied.map_err(|err| {
        let _ = fs::remove_file(&staging);
        FileSystemError::File {
            path: dest.to_path_buf(),
            action: "copy into",
            source: err,
        }
    })
}

fn copy_and_sync(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dest)?;
    let n = io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(n)
}

fn staging_path(dest: &Path) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.{}-{seq}.part", std::process::id()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_ensure_dir_exists() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x/y/z");
        ensure_dir_exists(&target).unwrap();
        assert!(target.is_dir());
        ensure_dir_exists(&target).unwrap();

        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(matches!(
            ensure_dir_exists(&file),
            Err(FileSystemError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_regular_file_size() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("blob");
        fs::write(&file, b"12345").unwrap();

        assert_eq!(regular_file_size(&file).unwrap(), Some(5));
        assert_eq!(regular_file_size(dir.path().join("missing")).unwrap(), None);
        assert_eq!(regular_file_size(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_atomic_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"payload").unwrap();

        let dest = dir.path().join("out/dest");
        let n = atomic_copy(&src, &dest).unwrap();

        assert_eq!(n, 7);
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_copy_missing_source() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("dest");
        assert!(atomic_copy(dir.path().join("missing"), &dest).is_err());
        assert!(!dest.exists());
    }
}
