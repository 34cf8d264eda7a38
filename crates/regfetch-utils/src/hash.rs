use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
};

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{HashError, HashResult};

/// Content hash algorithms accepted in registry digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Algorithm tag as it appears before the `:` of a digest string.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Number of lowercase hex characters an encoded hash of this algorithm has.
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(HashError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher over one of the supported algorithms.
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the lowercase hex encoding of the hash.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// A reader adapter that hashes and counts every byte read through it.
///
/// Used to verify streamed content without buffering it: wrap the source,
/// copy it to its destination, then call [`HashingReader::finish`].
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the hex hash and the number of bytes read so far.
    pub fn finish(self) -> (String, u64) {
        (self.hasher.finalize_hex(), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Hashes an in-memory buffer and returns the lowercase hex encoding.
///
/// # Example
///
/// ```
/// use regfetch_utils::hash::{checksum_bytes, HashAlgorithm};
///
/// assert_eq!(
///     checksum_bytes(HashAlgorithm::Sha256, b""),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
pub fn checksum_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Calculates the checksum of a file by streaming its contents.
///
/// # Errors
///
/// * [`HashError::ReadFailed`] if the file cannot be opened or read.
pub fn calculate_checksum<P: AsRef<Path>>(
    file_path: P,
    algorithm: HashAlgorithm,
) -> HashResult<String> {
    let file_path = file_path.as_ref();
    let read_failed = |source| {
        HashError::ReadFailed {
            path: file_path.to_path_buf(),
            source,
        }
    };

    let file = File::open(file_path).map_err(read_failed)?;
    let mut reader = HashingReader::new(file, algorithm);
    io::copy(&mut reader, &mut io::sink()).map_err(read_failed)?;
    Ok(reader.finish().0)
}
