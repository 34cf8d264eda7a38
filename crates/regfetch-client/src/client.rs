use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use regfetch_config::{
    config::{Config, PlatformConfig, DEFAULT_MAX_MANIFEST_SIZE},
    http::HttpClientConfig,
    registry::{Credentials, Registry},
};
use regfetch_utils::{fs::atomic_copy, lock::KeyedLock};
use tracing::{debug, info, warn};
use ureq::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LINK, RANGE},
    HeaderValue, Method,
};
use url::{form_urlencoded, Url};

use crate::{
    auth::AuthService,
    blob::{BlobRequest, BlobResult, BlobSource, ResumableBody},
    cache::{source_error, ContentCache, FileCache},
    digest::ImageDigest,
    error::{
        AuthKind, ClientError, ErrorCategory, HttpKind, IntegrityKind, ParseKind, Result,
        TransportError,
    },
    http::{build_range_header, build_request_uri, HttpExecutor, HttpRequest, HttpResponse},
    http_client::{Transport, UreqTransport},
    manifest::{ImageConfig, Manifest, ManifestHead, ManifestResult, TagList, MANIFEST_ACCEPT},
    p2p::{NoopP2p, P2pExecutor, SharedDirP2p},
    reference::{validate_repository, ImageRef},
};

const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const MAX_TAG_LIST_SIZE: u64 = 16 * 1024 * 1024;

/// Pulls manifests, tags and blobs from one registry.
///
/// Blobs are looked up in the content cache first, then asked of peers,
/// and only then downloaded from the origin. Whatever reaches the cache has
/// been verified against its digest. Manifests and tag lists always come
/// from the origin since tags move.
///
/// All collaborators are shared, so one client can serve many threads.
pub struct RegistryClient {
    registry: String,
    base_url: Url,
    credentials: Option<Credentials>,
    executor: HttpExecutor,
    auth: AuthService,
    cache: Arc<dyn ContentCache>,
    p2p: Arc<dyn P2pExecutor>,
    platform: PlatformConfig,
    max_manifest_size: u64,
    inflight: KeyedLock,
}

pub struct RegistryClientBuilder {
    registry: Registry,
    http: HttpClientConfig,
    token_ttl: Duration,
    platform: PlatformConfig,
    max_manifest_size: u64,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn ContentCache>>,
    p2p: Arc<dyn P2pExecutor>,
}

impl RegistryClientBuilder {
    pub fn http_config(mut self, http: HttpClientConfig) -> Self {
        self.http = http;
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn platform(mut self, platform: PlatformConfig) -> Self {
        self.platform = platform;
        self
    }

    pub fn max_manifest_size(mut self, size: u64) -> Self {
        self.max_manifest_size = size;
        self
    }

    /// Replaces the default `ureq` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses a [`FileCache`] rooted at `dir`.
    pub fn cache_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.cache(Arc::new(FileCache::new(dir)))
    }

    pub fn p2p(mut self, p2p: Arc<dyn P2pExecutor>) -> Self {
        self.p2p = p2p;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        self.registry.validate()?;
        self.http.validate()?;
        if self.token_ttl.is_zero() {
            return Err(ClientError::Config("token lifetime must be greater than zero".into()));
        }
        let base_url = self.registry.base_url()?;
        let cache = self
            .cache
            .ok_or_else(|| ClientError::Config("no content cache configured".into()))?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(UreqTransport::new(&self.http)),
        };

        let executor = HttpExecutor::new(transport, self.http);
        let auth = AuthService::new(executor.clone(), self.token_ttl);

        Ok(RegistryClient {
            registry: self.registry.name.clone(),
            credentials: self.registry.credentials(),
            base_url,
            executor,
            auth,
            cache,
            p2p: self.p2p,
            platform: self.platform,
            max_manifest_size: self.max_manifest_size,
            inflight: KeyedLock::new(),
        })
    }
}

impl RegistryClient {
    pub fn builder(registry: Registry) -> RegistryClientBuilder {
        RegistryClientBuilder {
            registry,
            http: HttpClientConfig::default(),
            token_ttl: Duration::from_secs(300),
            platform: PlatformConfig::default(),
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            transport: None,
            cache: None,
            p2p: Arc::new(NoopP2p),
        }
    }

    /// Client for the named registry, or the default one, wired from `config`.
    pub fn from_config(config: &Config, registry: Option<&str>) -> Result<Self> {
        let entry = match registry {
            Some(name) => config.get_registry(name)?,
            None => config.default_registry()?,
        };

        let p2p: Arc<dyn P2pExecutor> = match config.get_shared_dir()? {
            Some(dir) => {
                debug!("sharing content through {}", dir.display());
                Arc::new(SharedDirP2p::new(dir))
            }
            None => Arc::new(NoopP2p),
        };

        Self::builder(entry.clone())
            .http_config(config.http.clone())
            .token_ttl(config.auth.default_token_ttl)
            .platform(config.platform.clone())
            .max_manifest_size(config.max_manifest_size)
            .cache_dir(config.get_cache_path()?)
            .p2p(p2p)
            .build()
    }

    pub fn registry_name(&self) -> &str {
        &self.registry
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cache(&self) -> &Arc<dyn ContentCache> {
        &self.cache
    }

    /// Repository path as the registry expects it. Docker Hub keeps
    /// official images under `library/`.
    pub fn repository_path(&self, repository: &str) -> String {
        let hub = self
            .base_url
            .host_str()
            .is_some_and(|host| host == "docker.io" || host.ends_with(".docker.io"));
        if hub && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        }
    }

    fn endpoint(&self, path: &str, query: Option<&str>) -> Result<Url> {
        let host = self.base_url.host_str().ok_or_else(|| {
            ClientError::Config(format!("registry URL {} has no host", self.base_url))
        })?;
        build_request_uri(
            self.base_url.scheme(),
            host,
            self.base_url.port(),
            path,
            query,
        )
    }

    /// Sends `request` with whatever authorization the registry wants.
    ///
    /// A `401` triggers one fresh token acquisition from the challenge in the
    /// response. A second `401` means the credentials are not good enough.
    fn send_authorized(&self, repository: &str, mut request: HttpRequest) -> Result<HttpResponse> {
        let scope = format!("repository:{repository}:pull");
        let credentials = self.credentials.as_ref();

        if let Some(value) = self.auth.authorize(&self.base_url, &scope, credentials)? {
            request.headers.insert(AUTHORIZATION, value);
        }
        let response = self.executor.execute(&request)?;
        if response.status != 401 {
            return Ok(response);
        }

        debug!("{} rejected our authorization, requesting a new token", request.url);
        let value = self
            .auth
            .reauthorize(&self.base_url, &scope, credentials, &response)?;
        request.headers.insert(AUTHORIZATION, value);

        let response = self.executor.execute(&request)?;
        if response.status == 401 {
            return Err(ClientError::auth(
                AuthKind::TokenFailed,
                Some(401),
                format!("{} rejected a freshly issued token", request.url),
            ));
        }
        Ok(response)
    }

    fn manifest_request(&self, method: Method, repository: &str, reference: &str) -> Result<HttpRequest> {
        let url = self.endpoint(&format!("/v2/{repository}/manifests/{reference}"), None)?;
        let accept = HeaderValue::from_str(&MANIFEST_ACCEPT.join(", "))
            .map_err(|err| ClientError::Config(err.to_string()))?;
        Ok(HttpRequest::new(method, url).header(ACCEPT, accept))
    }

    /// Fetches the manifest `reference` (a tag or a digest) from the origin.
    ///
    /// The digest of the received bytes is checked against the digest
    /// reference and the `Docker-Content-Digest` header before parsing.
    pub fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<ManifestResult> {
        let image = parse_reference(repository, reference)?;
        let repository = self.repository_path(image.repository());

        let request = self.manifest_request(Method::GET, &repository, reference)?;
        let response = self
            .send_authorized(&repository, request)?
            .expect_success(format!("GET manifest {repository}:{reference}"))?;

        if let Some(length) = response.content_length() {
            if length > self.max_manifest_size {
                return Err(too_large(length, self.max_manifest_size));
            }
        }

        let content_type = response.header(CONTENT_TYPE).map(String::from);
        let header_digest = match response.header(CONTENT_DIGEST_HEADER) {
            Some(raw) => {
                Some(ImageDigest::parse(raw.trim()).map_err(|err| {
                    ClientError::parse(ParseKind::Manifest, format!("bad digest header: {err}"))
                })?)
            }
            None => None,
        };

        let limit = self.max_manifest_size;
        let raw = response.read_body(limit).map_err(|err| {
            if err.kind() == io::ErrorKind::InvalidData {
                too_large(limit + 1, limit)
            } else {
                source_error(err)
            }
        })?;

        for expected in image.digest().into_iter().chain(header_digest.as_ref()) {
            if !expected.matches(&raw) {
                return Err(ClientError::Integrity {
                    kind: IntegrityKind::DigestMismatch,
                    expected: expected.to_string(),
                    actual: ImageDigest::compute(expected.algorithm(), &raw).to_string(),
                });
            }
        }
        let digest = image
            .digest()
            .cloned()
            .or(header_digest)
            .unwrap_or_else(|| ImageDigest::sha256_of(&raw));

        let manifest = Manifest::parse(content_type.as_deref(), &raw)?;
        debug!("fetched manifest {}@{} ({} bytes)", repository, digest, raw.len());

        Ok(ManifestResult {
            digest,
            media_type: manifest.media_type().to_string(),
            content_length: raw.len() as u64,
            manifest,
            raw,
        })
    }

    /// Like [`fetch_manifest`](Self::fetch_manifest), but an index is
    /// resolved to the manifest for the configured platform.
    pub fn resolve_manifest(&self, repository: &str, reference: &str) -> Result<ManifestResult> {
        let result = self.fetch_manifest(repository, reference)?;
        let Some(index) = result.manifest.as_index() else {
            return Ok(result);
        };

        let platform = &self.platform;
        let entry = index
            .select(
                &platform.os,
                &platform.architecture,
                platform.variant.as_deref(),
            )
            .ok_or_else(|| {
                ClientError::parse(ParseKind::Manifest, format!("index {} lists no manifests", result.digest))
            })?;
        debug!(
            "index {} resolved to {} for {}/{}",
            result.digest, entry.digest, platform.os, platform.architecture
        );

        let resolved = self.fetch_manifest(repository, &entry.digest.to_string())?;
        if resolved.manifest.as_index().is_some() {
            return Err(ClientError::parse(
                ParseKind::Manifest,
                format!("index {} points at another index", result.digest),
            ));
        }
        Ok(resolved)
    }

    /// Resolves `image` to a platform manifest.
    pub fn fetch_image(&self, image: &ImageRef) -> Result<ManifestResult> {
        self.resolve_manifest(image.repository(), &image.reference())
    }

    /// Probes a manifest without downloading it. `None` when it does not exist.
    pub fn head_manifest(&self, repository: &str, reference: &str) -> Result<Option<ManifestHead>> {
        let image = parse_reference(repository, reference)?;
        let repository = self.repository_path(image.repository());

        let request = self.manifest_request(Method::HEAD, &repository, reference)?;
        let response = self.send_authorized(&repository, request)?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.expect_success(format!("HEAD manifest {repository}:{reference}"))?;

        let digest = response
            .header(CONTENT_DIGEST_HEADER)
            .ok_or_else(|| {
                ClientError::parse(
                    ParseKind::Manifest,
                    format!("HEAD {repository}:{reference} returned no Docker-Content-Digest"),
                )
            })
            .and_then(|raw| {
                ImageDigest::parse(raw.trim()).map_err(|err| {
                    ClientError::parse(ParseKind::Manifest, format!("bad digest header: {err}"))
                })
            })?;

        Ok(Some(ManifestHead {
            digest,
            media_type: response.header(CONTENT_TYPE).map(String::from),
            size: response.content_length(),
        }))
    }

    /// Fetches the config blob `manifest` refers to into `target`.
    pub fn fetch_config(&self, repository: &str, manifest: &Manifest, target: &Path) -> Result<BlobResult> {
        let descriptor = manifest.config().ok_or_else(|| {
            ClientError::parse(ParseKind::Manifest, "an image index has no config blob")
        })?;
        self.fetch_blob(&BlobRequest::from_descriptor(repository, descriptor), target)
    }

    /// Fetches and parses the config blob of `manifest`.
    pub fn image_config(&self, repository: &str, manifest: &Manifest) -> Result<ImageConfig> {
        let descriptor = manifest.config().ok_or_else(|| {
            ClientError::parse(ParseKind::Manifest, "an image index has no config blob")
        })?;
        let (path, _, _) = self.acquire(&BlobRequest::from_descriptor(repository, descriptor))?;
        let bytes = std::fs::read(&path).map_err(|err| {
            ClientError::cache(format!("reading {} failed", path.display()), Some(err))
        })?;
        ImageConfig::parse(&bytes)
    }

    /// Makes the blob available at `target`: from the cache, else from a
    /// peer, else from the origin.
    pub fn fetch_blob(&self, request: &BlobRequest, target: &Path) -> Result<BlobResult> {
        let (cached, source, bytes_transferred) = self.acquire(request)?;

        let size = atomic_copy(&cached, target)
            .map_err(|err| ClientError::cache(err.to_string(), None))?;

        Ok(BlobResult {
            digest: request.digest.clone(),
            size,
            media_type: request.media_type.clone(),
            path: target.to_path_buf(),
            source,
            bytes_transferred,
        })
    }

    /// Gets the blob into the cache and returns its cache location.
    fn acquire(&self, request: &BlobRequest) -> Result<(PathBuf, BlobSource, u64)> {
        validate_repository(&request.repository)?;
        let digest = &request.digest;
        let kind = request.kind();

        if let Some(path) = self.cached(request)? {
            return Ok((path, BlobSource::Cache, 0));
        }

        // One fetch per digest at a time; whoever waited finds it cached.
        let _inflight = self.inflight.acquire(&digest.to_string());
        if let Some(path) = self.cached(request)? {
            return Ok((path, BlobSource::Cache, 0));
        }

        if let Some(peer_path) = self.p2p.fetch(digest, request.expected_size, kind) {
            match self.populate_from_peer(request, &peer_path) {
                Ok(path) => {
                    debug!("{} served by a peer", digest);
                    return Ok((path, BlobSource::Peer, 0));
                }
                Err(err)
                    if matches!(err.category(), ErrorCategory::Integrity | ErrorCategory::Http) =>
                {
                    warn!("discarding peer copy of {}: {}", digest, err);
                }
                Err(err) => return Err(err),
            }
        }

        let repository = self.repository_path(&request.repository);
        let url = self.endpoint(&format!("/v2/{repository}/blobs/{digest}"), None)?;
        let response = self
            .send_authorized(&repository, HttpRequest::get(url.clone()))?
            .expect_success(format!("GET blob {repository}@{digest}"))?;

        info!(
            "downloading {} {} from {}",
            kind,
            digest,
            self.registry
        );

        let reopen = |offset: u64| {
            let range = build_range_header(offset, None)?;
            let value = HeaderValue::from_str(&range)
                .map_err(|err| ClientError::Config(err.to_string()))?;
            self.send_authorized(&repository, HttpRequest::get(url.clone()).header(RANGE, value))
        };
        let mut body = ResumableBody::new(&self.executor, response, request.expected_size, reopen);
        let path = self.cache.populate(
            digest,
            request.media_type.as_deref(),
            &mut body,
            request.expected_size,
        )?;
        let transferred = body.received();

        let size = self.cache.head(digest)?.unwrap_or(transferred);
        self.p2p.publish(digest, &path, size, kind);

        Ok((path, BlobSource::Origin, transferred))
    }

    /// Cache location of the requested blob. An entry that disappears
    /// between lookup and size check counts as a miss.
    fn cached(&self, request: &BlobRequest) -> Result<Option<PathBuf>> {
        let digest = &request.digest;
        let Some(path) = self.cache.lookup(digest)? else {
            return Ok(None);
        };
        let Some(size) = self.cache.head(digest)? else {
            debug!("{} left the cache before it could be used", digest);
            return Ok(None);
        };

        if let Some(expected) = request.expected_size.filter(|e| *e != size) {
            return Err(ClientError::Integrity {
                kind: IntegrityKind::SizeMismatch,
                expected: format!("{expected} bytes"),
                actual: format!("{size} bytes"),
            });
        }
        debug!("{} served from cache", digest);
        Ok(Some(path))
    }

    fn populate_from_peer(&self, request: &BlobRequest, peer_path: &Path) -> Result<PathBuf> {
        let mut file = File::open(peer_path).map_err(|err| {
            ClientError::Http {
                kind: HttpKind::Network,
                status: None,
                message: format!("cannot open peer copy {}", peer_path.display()),
                source: Some(TransportError::Io(err)),
            }
        })?;
        self.cache.populate(
            &request.digest,
            request.media_type.as_deref(),
            &mut file,
            request.expected_size,
        )
    }

    /// Bytes `start..=end` of a blob (to the end when `end` is `None`),
    /// straight from the origin.
    pub fn fetch_blob_range(
        &self,
        repository: &str,
        digest: &ImageDigest,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>> {
        validate_repository(repository)?;
        let range = build_range_header(start, end)?;
        let repository = self.repository_path(repository);
        let url = self.endpoint(&format!("/v2/{repository}/blobs/{digest}"), None)?;
        let value =
            HeaderValue::from_str(&range).map_err(|err| ClientError::Config(err.to_string()))?;

        let response = self.send_authorized(&repository, HttpRequest::get(url).header(RANGE, value))?;
        let status = response.status;
        let mut reader = match status {
            206 => response.into_reader(),
            200 => {
                debug!("origin ignored {}, slicing the full body", range);
                let mut reader = response.into_reader();
                io::copy(&mut reader.by_ref().take(start), &mut io::sink()).map_err(source_error)?;
                reader
            }
            _ => {
                return Err(ClientError::bad_status(
                    status,
                    format!("GET blob {repository}@{digest} ({range})"),
                ))
            }
        };

        let mut bytes = Vec::new();
        // `end` is inclusive; a range reaching u64::MAX has no representable length.
        let read = match end.and_then(|end| (end - start).checked_add(1)) {
            Some(len) => reader.take(len).read_to_end(&mut bytes),
            None => reader.read_to_end(&mut bytes),
        };
        read.map_err(source_error)?;
        Ok(bytes)
    }

    /// Size of a blob, from the cache or a HEAD request. `None` when the
    /// origin does not have it.
    pub fn head_blob(&self, repository: &str, digest: &ImageDigest) -> Result<Option<u64>> {
        validate_repository(repository)?;
        if let Some(size) = self.cache.head(digest)? {
            return Ok(Some(size));
        }

        let repository = self.repository_path(repository);
        let url = self.endpoint(&format!("/v2/{repository}/blobs/{digest}"), None)?;
        let response = self.send_authorized(&repository, HttpRequest::head(url))?;
        match response.status {
            404 => Ok(None),
            _ => {
                let response =
                    response.expect_success(format!("HEAD blob {repository}@{digest}"))?;
                response.content_length().map(Some).ok_or_else(|| {
                    ClientError::http(
                        HttpKind::BadStatus,
                        Some(response.status),
                        format!("HEAD blob {repository}@{digest} returned no Content-Length"),
                    )
                })
            }
        }
    }

    /// One page of tags. `last` is the cursor from a previous page.
    pub fn list_tags(&self, repository: &str, n: Option<u32>, last: Option<&str>) -> Result<TagList> {
        validate_repository(repository)?;
        let repository = self.repository_path(repository);

        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(n) = n {
            query.append_pair("n", &n.to_string());
        }
        if let Some(last) = last {
            query.append_pair("last", last);
        }
        let query = query.finish();

        let url = self.endpoint(&format!("/v2/{repository}/tags/list"), Some(&query))?;
        let response = self
            .send_authorized(&repository, HttpRequest::get(url))?
            .expect_success(format!("GET tags of {repository}"))?;

        let next = response.header(LINK).and_then(next_page_cursor);
        let body = response.read_body(MAX_TAG_LIST_SIZE).map_err(source_error)?;
        let mut tags: TagList = serde_json::from_slice(&body).map_err(|err| {
            ClientError::parse(ParseKind::Manifest, format!("malformed tag list: {err}"))
        })?;
        tags.next = next;
        Ok(tags)
    }

    /// Every tag of `repository`, following pagination to the end.
    pub fn list_all_tags(&self, repository: &str, page_size: Option<u32>) -> Result<Vec<String>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.list_tags(repository, page_size, cursor.as_deref())?;
            all.extend(page.tags);
            match page.next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(all)
    }
}

fn parse_reference(repository: &str, reference: &str) -> Result<ImageRef> {
    let image = if reference.contains(':') {
        ImageRef::new(repository, None, Some(reference))
    } else {
        ImageRef::new(repository, Some(reference), None)
    };
    Ok(image?)
}

fn too_large(size: u64, limit: u64) -> ClientError {
    ClientError::parse(
        ParseKind::Manifest,
        format!("manifest of {size} bytes exceeds the {limit} byte limit"),
    )
}

/// The `last` cursor from a `Link: <...?last=x&n=y>; rel="next"` header.
fn next_page_cursor(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let (target, params) = entry.trim().split_once(';')?;
        let is_next = params.split(';').any(|param| {
            param
                .trim()
                .strip_prefix("rel=")
                .is_some_and(|rel| rel.trim_matches('"') == "next")
        });
        if !is_next {
            return None;
        }

        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        let (_, query) = target.split_once('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "last")
            .map(|(_, value)| value.into_owned())
    })
}
