use std::{fmt, str::FromStr};

use regfetch_utils::hash::{checksum_bytes, HashAlgorithm};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ReferenceError;

/// An algorithm-tagged content hash, e.g. `sha256:<64 hex chars>`.
///
/// Only lowercase hex of the exact length for the algorithm is accepted,
/// so two equal digests always have the same string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageDigest {
    algorithm: HashAlgorithm,
    hex: String,
}

impl ImageDigest {
    pub fn new(algorithm: HashAlgorithm, hex: impl Into<String>) -> Result<Self, ReferenceError> {
        let hex = hex.into();
        let invalid = |reason: String| {
            ReferenceError::InvalidDigest {
                digest: format!("{algorithm}:{hex}"),
                reason,
            }
        };

        if hex.len() != algorithm.hex_len() {
            return Err(invalid(format!(
                "expected {} hex characters, found {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid("only lowercase hex characters are allowed".into()));
        }

        Ok(Self {
            algorithm,
            hex,
        })
    }

    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            ReferenceError::InvalidDigest {
                digest: s.to_string(),
                reason: "missing `<algorithm>:` prefix".into(),
            }
        })?;

        let algorithm = algorithm.parse::<HashAlgorithm>().map_err(|err| {
            ReferenceError::InvalidDigest {
                digest: s.to_string(),
                reason: err.to_string(),
            }
        })?;

        Self::new(algorithm, hex)
    }

    /// Digest of `bytes` under `algorithm`.
    pub fn compute(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            hex: checksum_bytes(algorithm, bytes),
        }
    }

    pub fn sha256_of(bytes: &[u8]) -> Self {
        Self::compute(HashAlgorithm::Sha256, bytes)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        checksum_bytes(self.algorithm, bytes) == self.hex
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for ImageDigest {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ImageDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}
