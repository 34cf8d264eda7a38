use std::{
    fmt,
    io::{self, Read},
    path::PathBuf,
};

use tracing::warn;

use crate::{
    digest::ImageDigest,
    error::{is_transient_io, ClientError, HttpKind, Result, TransportError},
    http::{HttpExecutor, HttpResponse},
    manifest::{ContentKind, Descriptor},
};

/// A blob to fetch from a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRequest {
    pub repository: String,
    pub digest: ImageDigest,
    pub expected_size: Option<u64>,
    pub media_type: Option<String>,
}

impl BlobRequest {
    pub fn new(repository: impl Into<String>, digest: ImageDigest) -> Self {
        Self {
            repository: repository.into(),
            digest,
            expected_size: None,
            media_type: None,
        }
    }

    /// Request for the content a manifest descriptor points at.
    pub fn from_descriptor(repository: impl Into<String>, descriptor: &Descriptor) -> Self {
        Self {
            repository: repository.into(),
            digest: descriptor.digest.clone(),
            expected_size: Some(descriptor.size),
            media_type: Some(descriptor.media_type.clone()),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn kind(&self) -> ContentKind {
        self.media_type
            .as_deref()
            .map_or(ContentKind::Other, ContentKind::from_media_type)
    }
}

/// Where the content of a [`BlobResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSource {
    Cache,
    Peer,
    Origin,
}

impl fmt::Display for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlobSource::Cache => "cache",
            BlobSource::Peer => "peer",
            BlobSource::Origin => "origin",
        };
        f.write_str(s)
    }
}

/// Outcome of a blob fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobResult {
    pub digest: ImageDigest,
    /// Verified size of the content.
    pub size: u64,
    pub media_type: Option<String>,
    /// Where the content was written.
    pub path: PathBuf,
    pub source: BlobSource,
    /// Bytes received from the origin for this call, zero for cache and peer hits.
    pub bytes_transferred: u64,
}

/// Body of a blob download that survives broken connections.
///
/// When a read fails with a transient I/O error, `reopen` is called with
/// the number of bytes already delivered and is expected to issue
/// `Range: bytes=<offset>-`. A `206` continues the stream; a `200` restarts
/// it, and the already-delivered prefix is skipped. Each resume costs one
/// retry from the executor's budget and waits out its backoff.
pub(crate) struct ResumableBody<'a, F> {
    executor: &'a HttpExecutor,
    reopen: F,
    inner: Box<dyn Read + Send>,
    expected: Option<u64>,
    received: u64,
    skip: u64,
    resumes: u32,
}

impl<'a, F> ResumableBody<'a, F>
where
    F: FnMut(u64) -> Result<HttpResponse>,
{
    pub(crate) fn new(
        executor: &'a HttpExecutor,
        response: HttpResponse,
        expected: Option<u64>,
        reopen: F,
    ) -> Self {
        Self {
            executor,
            reopen,
            inner: response.into_reader(),
            expected,
            received: 0,
            skip: 0,
            resumes: 0,
        }
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    fn resume(&mut self, err: io::Error) -> io::Result<()> {
        if !is_transient_io(&err) {
            return Err(err);
        }
        if self.resumes >= self.executor.config().max_retries {
            return Err(io::Error::other(ClientError::Http {
                kind: HttpKind::RetryExhausted,
                status: None,
                message: format!(
                    "download interrupted at byte {} after {} resumes",
                    self.received, self.resumes
                ),
                source: Some(TransportError::Io(err)),
            }));
        }

        warn!(
            "download interrupted at byte {}: {}, resuming",
            self.received, err
        );
        self.executor.pause(self.resumes, None);
        self.resumes += 1;

        let response = (self.reopen)(self.received).map_err(io::Error::other)?;
        match response.status {
            206 => self.skip = 0,
            200 => self.skip = self.received,
            status => {
                return Err(io::Error::other(ClientError::bad_status(
                    status,
                    "resuming blob download",
                )))
            }
        }
        self.inner = response.into_reader();
        Ok(())
    }
}

impl<F> Read for ResumableBody<'_, F>
where
    F: FnMut(u64) -> Result<HttpResponse>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let result = if self.skip > 0 {
                match io::copy(&mut self.inner.by_ref().take(self.skip), &mut io::sink()) {
                    Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => {
                        self.skip -= n;
                        continue;
                    }
                    Err(err) => Err(err),
                }
            } else {
                match self.inner.read(buf) {
                    Ok(0) if self.expected.is_some_and(|e| self.received < e) => {
                        Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                    }
                    other => other,
                }
            };

            match result {
                Ok(n) => {
                    self.received += n as u64;
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => self.resume(err)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::Cursor,
        sync::Arc,
    };

    use ureq::http::HeaderMap;

    use super::*;
    use crate::{
        cache::source_error,
        test_utils::{fast_config, PanicTransport},
    };

    /// Yields `data` and then fails with `kind`.
    struct Broken {
        data: Cursor<Vec<u8>>,
        kind: io::ErrorKind,
    }

    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::from(self.kind)),
                n => Ok(n),
            }
        }
    }

    fn broken(data: &[u8], kind: io::ErrorKind) -> HttpResponse {
        HttpResponse::new(
            200,
            HeaderMap::new(),
            Broken {
                data: Cursor::new(data.to_vec()),
                kind,
            },
        )
    }

    fn full(status: u16, data: &[u8]) -> HttpResponse {
        HttpResponse::new(status, HeaderMap::new(), Cursor::new(data.to_vec()))
    }

    fn executor(max_retries: u32) -> HttpExecutor {
        HttpExecutor::new(Arc::new(PanicTransport), fast_config(max_retries))
    }

    #[test]
    fn test_request_from_descriptor() {
        let descriptor: Descriptor = serde_json::from_str(
            r#"{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
                "size": 3
            }"#,
        )
        .unwrap();

        let request = BlobRequest::from_descriptor("app", &descriptor);
        assert_eq!(request.expected_size, Some(3));
        assert_eq!(request.kind(), ContentKind::Layer);
        assert_eq!(
            BlobRequest::new("app", descriptor.digest.clone()).kind(),
            ContentKind::Other
        );
    }

    #[test]
    fn test_resume_with_partial_content() {
        let exec = executor(2);
        let offsets = RefCell::new(Vec::new());
        let mut body = ResumableBody::new(
            &exec,
            broken(b"hello ", io::ErrorKind::ConnectionReset),
            Some(11),
            |offset| {
                offsets.borrow_mut().push(offset);
                Ok(full(206, b"world"))
            },
        );

        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(body.received(), 11);
        assert_eq!(*offsets.borrow(), vec![6]);
    }

    #[test]
    fn test_resume_with_full_restart_skips_prefix() {
        let exec = executor(2);
        let mut body = ResumableBody::new(
            &exec,
            broken(b"hello ", io::ErrorKind::ConnectionReset),
            Some(11),
            |_| Ok(full(200, b"hello world")),
        );

        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_short_body_triggers_resume() {
        let exec = executor(1);
        let mut body = ResumableBody::new(&exec, full(200, b"abc"), Some(6), |offset| {
            assert_eq!(offset, 3);
            Ok(full(206, b"def"))
        });

        let mut out = Vec::new();
        body.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_resume_budget_exhausted() {
        let exec = executor(1);
        let mut body = ResumableBody::new(
            &exec,
            broken(b"a", io::ErrorKind::ConnectionReset),
            Some(10),
            |_| Ok(broken(b"b", io::ErrorKind::ConnectionReset)),
        );

        let mut out = Vec::new();
        let err = source_error(body.read_to_end(&mut out).unwrap_err());
        assert!(matches!(
            err,
            ClientError::Http {
                kind: HttpKind::RetryExhausted,
                ..
            }
        ));
    }

    #[test]
    fn test_permanent_errors_are_not_resumed() {
        let exec = executor(3);
        let mut body = ResumableBody::new(
            &exec,
            broken(b"a", io::ErrorKind::PermissionDenied),
            None,
            |_| -> Result<HttpResponse> { panic!("must not resume") },
        );
        let mut out = Vec::new();
        assert_eq!(
            body.read_to_end(&mut out).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );

        let mut body = ResumableBody::new(
            &exec,
            broken(b"a", io::ErrorKind::ConnectionReset),
            None,
            |_| Ok(full(416, b"")),
        );
        let err = source_error(body.read_to_end(&mut out).unwrap_err());
        assert!(matches!(
            err,
            ClientError::Http {
                kind: HttpKind::BadStatus,
                status: Some(416),
                ..
            }
        ));
    }
}
