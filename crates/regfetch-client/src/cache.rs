//! Content-addressed blob storage.
//!
//! Entries live at `<root>/blobs/<algorithm>/<hex>`. Content is streamed
//! into a temporary file under `<root>/tmp`, hashed on the way, and only
//! renamed into place once its size and digest check out. A visible entry
//! is therefore always complete and correct.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use regfetch_utils::{
    fs::{ensure_dir_exists, regular_file_size},
    hash::HashingReader,
    lock::{FileLock, KeyedLock},
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
    digest::ImageDigest,
    error::{ClientError, HttpKind, IntegrityKind, Result, TransportError},
};

const COPY_BUFFER: usize = 64 * 1024;

pub trait ContentCache: Send + Sync {
    /// Location of the complete entry for `digest`, if present.
    fn lookup(&self, digest: &ImageDigest) -> Result<Option<PathBuf>>;

    /// Size of the entry for `digest`, if present.
    fn head(&self, digest: &ImageDigest) -> Result<Option<u64>>;

    /// Stores the content read from `source` under `digest`.
    ///
    /// Fails with an `Integrity` error, leaving no entry behind, when the
    /// content does not hash to `digest` or its length differs from
    /// `expected_size`.
    fn populate(
        &self,
        digest: &ImageDigest,
        media_type: Option<&str>,
        source: &mut dyn Read,
        expected_size: Option<u64>,
    ) -> Result<PathBuf>;
}

/// [`ContentCache`] on the local filesystem.
///
/// Writers for one digest are serialized within the process by a keyed
/// lock and across processes by a `flock` on `<root>/locks/<digest>.lock`.
pub struct FileCache {
    root: PathBuf,
    writers: KeyedLock,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: KeyedLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, digest: &ImageDigest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().name())
            .join(digest.hex())
    }

    fn size_of(&self, digest: &ImageDigest) -> Result<Option<u64>> {
        regular_file_size(self.entry_path(digest))
            .map_err(|err| ClientError::cache(err.to_string(), None))
    }

    fn write_verified(
        &self,
        digest: &ImageDigest,
        source: &mut dyn Read,
        expected_size: Option<u64>,
    ) -> Result<NamedTempFile> {
        let tmp_dir = self.root.join("tmp");
        ensure_dir_exists(&tmp_dir).map_err(|err| ClientError::cache(err.to_string(), None))?;

        let mut tmp = NamedTempFile::new_in(&tmp_dir).map_err(|err| {
            ClientError::cache(
                format!("cannot create temporary file in {}", tmp_dir.display()),
                Some(err),
            )
        })?;

        let mut reader = HashingReader::new(source, digest.algorithm());
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(source_error(err)),
            };
            tmp.write_all(&buf[..n]).map_err(|err| {
                ClientError::cache(format!("writing {digest} to the cache failed"), Some(err))
            })?;
            if expected_size.is_some_and(|expected| reader.bytes_read() > expected) {
                break;
            }
        }

        let (hex, written) = reader.finish();
        if let Some(expected) = expected_size {
            if written != expected {
                return Err(ClientError::Integrity {
                    kind: IntegrityKind::SizeMismatch,
                    expected: format!("{expected} bytes"),
                    actual: if written > expected {
                        format!("more than {expected} bytes")
                    } else {
                        format!("{written} bytes")
                    },
                });
            }
        }
        if hex != digest.hex() {
            return Err(ClientError::Integrity {
                kind: IntegrityKind::DigestMismatch,
                expected: digest.to_string(),
                actual: format!("{}:{hex}", digest.algorithm()),
            });
        }

        tmp.as_file().sync_all().map_err(|err| {
            ClientError::cache(format!("flushing {digest} to disk failed"), Some(err))
        })?;
        Ok(tmp)
    }
}

impl ContentCache for FileCache {
    fn lookup(&self, digest: &ImageDigest) -> Result<Option<PathBuf>> {
        Ok(self.size_of(digest)?.map(|_| self.entry_path(digest)))
    }

    fn head(&self, digest: &ImageDigest) -> Result<Option<u64>> {
        self.size_of(digest)
    }

    fn populate(
        &self,
        digest: &ImageDigest,
        media_type: Option<&str>,
        source: &mut dyn Read,
        expected_size: Option<u64>,
    ) -> Result<PathBuf> {
        let key = digest.to_string();
        let _guard = self.writers.acquire(&key);
        let _flock = FileLock::acquire(&self.root.join("locks"), &key)
            .map_err(|err| ClientError::cache(err.to_string(), None))?;

        let dest = self.entry_path(digest);
        if let Some(size) = self.size_of(digest)? {
            if expected_size.is_none_or(|expected| expected == size) {
                debug!("{} already cached by a concurrent writer", digest);
                return Ok(dest);
            }
        }

        let tmp = self.write_verified(digest, source, expected_size)?;

        if let Some(parent) = dest.parent() {
            ensure_dir_exists(parent).map_err(|err| ClientError::cache(err.to_string(), None))?;
        }
        tmp.persist(&dest).map_err(|err| {
            ClientError::cache(
                format!("cannot move {digest} into {}", dest.display()),
                Some(err.error),
            )
        })?;

        debug!(
            "cached {} ({}) at {}",
            digest,
            media_type.unwrap_or("unknown type"),
            dest.display()
        );
        Ok(dest)
    }
}

/// Maps a failure reading the source stream. Readers that already know the
/// failure wrap a [`ClientError`] in the `io::Error`.
pub(crate) fn source_error(err: io::Error) -> ClientError {
    if err.get_ref().is_some_and(|inner| inner.is::<ClientError>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(client) = inner.downcast::<ClientError>() {
                return *client;
            }
        }
        return ClientError::http(HttpKind::Network, None, "content stream failed");
    }

    ClientError::Http {
        kind: HttpKind::Network,
        status: None,
        message: format!("reading content failed: {err}"),
        source: Some(TransportError::Io(err)),
    }
}
