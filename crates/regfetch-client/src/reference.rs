use std::fmt;

use crate::{digest::ImageDigest, error::ReferenceError};

/// A repository coordinate: a repository plus a tag, a digest, or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    repository: String,
    tag: Option<String>,
    digest: Option<ImageDigest>,
}

impl ImageRef {
    /// Builds a reference from parts. Blank tag/digest strings count as absent.
    pub fn new(
        repository: &str,
        tag: Option<&str>,
        digest: Option<&str>,
    ) -> Result<Self, ReferenceError> {
        let repository = repository.trim();
        if repository.is_empty() {
            return Err(ReferenceError::BlankRepository);
        }
        validate_repository(repository)?;

        let tag = tag.map(str::trim).filter(|t| !t.is_empty());
        let digest = digest.map(str::trim).filter(|d| !d.is_empty());
        if tag.is_none() && digest.is_none() {
            return Err(ReferenceError::MissingTagOrDigest);
        }

        if let Some(tag) = tag {
            validate_tag(tag)?;
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.map(String::from),
            digest: digest.map(ImageDigest::parse).transpose()?,
        })
    }

    /// Parses `repo`, `repo:tag`, `repo@digest` or `repo:tag@digest`.
    ///
    /// A bare repository means the `latest` tag. The registry itself is
    /// chosen from configuration, never from the reference.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (input, None),
        };

        let last_segment_start = name.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match name[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };

        let tag = match (tag, digest) {
            (None, None) => Some("latest"),
            (tag, _) => tag,
        };

        Self::new(repository, tag, digest)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&ImageDigest> {
        self.digest.as_ref()
    }

    /// The reference to request from the origin. A digest wins over a tag.
    pub fn reference(&self) -> String {
        self.digest
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.tag.clone())
            .unwrap_or_default()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

pub(crate) fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.bytes().all(|b| {
                b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
            })
            && c.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
    };

    if repository.split('/').all(valid_component) {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRepository(repository.to_string()))
    }
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let valid = tag.len() <= 128
        && tag
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}
