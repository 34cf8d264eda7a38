//! Peer-to-peer content sharing.
//!
//! Peers are strictly best effort: a failed fetch is a miss and a failed
//! publish is logged and dropped. Whatever a peer hands back is verified by
//! the content cache before anyone sees it.

use std::path::{Path, PathBuf};

use regfetch_utils::fs::{atomic_copy, regular_file_size};
use tracing::{debug, warn};

use crate::{digest::ImageDigest, manifest::ContentKind};

pub trait P2pExecutor: Send + Sync {
    /// A local file holding the peer copy of `digest`, if a peer has it now.
    fn fetch(&self, digest: &ImageDigest, size: Option<u64>, kind: ContentKind) -> Option<PathBuf>;

    /// Offers the verified file at `path` to peers.
    fn publish(&self, digest: &ImageDigest, path: &Path, size: u64, kind: ContentKind);
}

/// Used when peer sharing is disabled. Never has anything, never shares.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopP2p;

impl P2pExecutor for NoopP2p {
    fn fetch(&self, _digest: &ImageDigest, _size: Option<u64>, _kind: ContentKind) -> Option<PathBuf> {
        None
    }

    fn publish(&self, _digest: &ImageDigest, _path: &Path, _size: u64, _kind: ContentKind) {}
}

/// A directory shared between hosts (NFS, a synced volume) acting as the mesh.
///
/// Entries are stored as `<root>/<algorithm>/<hex>`, the same layout the
/// blob cache uses.
#[derive(Debug, Clone)]
pub struct SharedDirP2p {
    root: PathBuf,
}

impl SharedDirP2p {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, digest: &ImageDigest) -> PathBuf {
        self.root
            .join(digest.algorithm().name())
            .join(digest.hex())
    }
}

impl P2pExecutor for SharedDirP2p {
    fn fetch(&self, digest: &ImageDigest, size: Option<u64>, kind: ContentKind) -> Option<PathBuf> {
        let path = self.entry_path(digest);
        match regular_file_size(&path) {
            Ok(Some(found)) if size.is_none_or(|expected| expected == found) => {
                debug!("peer has {} {} ({} bytes)", kind, digest, found);
                Some(path)
            }
            Ok(Some(found)) => {
                warn!(
                    "ignoring peer copy of {}: {} bytes, expected {}",
                    digest,
                    found,
                    size.unwrap_or_default()
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!("peer lookup for {} failed: {}", digest, err);
                None
            }
        }
    }

    fn publish(&self, digest: &ImageDigest, path: &Path, size: u64, kind: ContentKind) {
        let dest = self.entry_path(digest);
        if matches!(regular_file_size(&dest), Ok(Some(existing)) if existing == size) {
            return;
        }

        match atomic_copy(path, &dest) {
            Ok(_) => debug!("published {} {} to {}", kind, digest, self.root.display()),
            Err(err) => warn!("failed to publish {} to peers: {}", digest, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_noop_never_has_content() {
        let digest = ImageDigest::sha256_of(b"x");
        let noop = NoopP2p;
        assert!(noop.fetch(&digest, Some(1), ContentKind::Layer).is_none());
        noop.publish(&digest, Path::new("/nonexistent"), 1, ContentKind::Layer);
    }

    #[test]
    fn test_shared_dir_publish_then_fetch() {
        let shared = tempdir().unwrap();
        let work = tempdir().unwrap();
        let p2p = SharedDirP2p::new(shared.path());

        let digest = ImageDigest::sha256_of(b"layer data");
        assert!(p2p.fetch(&digest, None, ContentKind::Layer).is_none());

        let src = work.path().join("blob");
        fs::write(&src, b"layer data").unwrap();
        p2p.publish(&digest, &src, 10, ContentKind::Layer);

        let found = p2p.fetch(&digest, Some(10), ContentKind::Layer).unwrap();
        assert_eq!(fs::read(found).unwrap(), b"layer data");
        assert!(shared.path().join("sha256").join(digest.hex()).is_file());
    }

    #[test]
    fn test_shared_dir_rejects_wrong_size() {
        let shared = tempdir().unwrap();
        let p2p = SharedDirP2p::new(shared.path());
        let digest = ImageDigest::sha256_of(b"abc");

        let entry = shared.path().join("sha256").join(digest.hex());
        fs::create_dir_all(entry.parent().unwrap()).unwrap();
        fs::write(&entry, b"ab").unwrap();

        assert!(p2p.fetch(&digest, Some(3), ContentKind::Config).is_none());
        assert!(p2p.fetch(&digest, None, ContentKind::Config).is_some());
    }

    #[test]
    fn test_publish_failure_is_swallowed() {
        let shared = tempdir().unwrap();
        let p2p = SharedDirP2p::new(shared.path());
        let digest = ImageDigest::sha256_of(b"abc");

        p2p.publish(&digest, Path::new("/nonexistent/source"), 3, ContentKind::Layer);
        assert!(p2p.fetch(&digest, None, ContentKind::Layer).is_none());
    }
}
