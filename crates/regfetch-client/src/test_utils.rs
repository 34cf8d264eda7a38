//! Fake transports and peers shared by the unit tests.

use std::{
    collections::VecDeque,
    io::{self, Cursor},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use regfetch_config::http::HttpClientConfig;
use ureq::http::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    digest::ImageDigest,
    error::TransportError,
    http::{HttpRequest, HttpResponse},
    http_client::Transport,
    manifest::ContentKind,
    p2p::P2pExecutor,
};

pub type Reply = Result<(u16, Vec<(&'static str, String)>, Vec<u8>), io::ErrorKind>;

pub fn ok(status: u16, body: impl Into<Vec<u8>>) -> Reply {
    Ok((status, Vec::new(), body.into()))
}

pub fn with_headers(
    status: u16,
    headers: &[(&'static str, &str)],
    body: impl Into<Vec<u8>>,
) -> Reply {
    Ok((
        status,
        headers.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        body.into(),
    ))
}

fn to_response(reply: Reply) -> Result<HttpResponse, TransportError> {
    match reply {
        Ok((status, headers, body)) => {
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.append(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
            Ok(HttpResponse::new(status, map, Cursor::new(body)))
        }
        Err(kind) => Err(TransportError::Io(io::Error::from(kind))),
    }
}

/// Plays back a fixed sequence of replies and records every request.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unscripted request: {} {}", request.method, request.url));
        to_response(reply)
    }
}

/// Answers every request through a closure.
pub struct FnTransport<F> {
    handler: F,
    calls: AtomicUsize,
}

impl<F> FnTransport<F>
where
    F: Fn(&HttpRequest) -> Reply + Send + Sync,
{
    pub fn new(handler: F) -> Arc<Self> {
        Arc::new(Self {
            handler,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> Transport for FnTransport<F>
where
    F: Fn(&HttpRequest) -> Reply + Send + Sync,
{
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        to_response((self.handler)(request))
    }
}

/// Fails the test if any request reaches it.
pub struct PanicTransport;

impl Transport for PanicTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        panic!("transport must not be used: {} {}", request.method, request.url)
    }
}

/// A peer that serves one prepared file and records publishes.
#[derive(Default)]
pub struct FakePeer {
    pub serve: Option<PathBuf>,
    pub fetches: AtomicUsize,
    pub published: Mutex<Vec<(ImageDigest, u64, ContentKind)>>,
}

impl P2pExecutor for FakePeer {
    fn fetch(&self, _digest: &ImageDigest, _size: Option<u64>, _kind: ContentKind) -> Option<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.serve.clone()
    }

    fn publish(&self, digest: &ImageDigest, _path: &std::path::Path, size: u64, kind: ContentKind) {
        self.published
            .lock()
            .unwrap()
            .push((digest.clone(), size, kind));
    }
}

pub fn fast_config(max_retries: u32) -> HttpClientConfig {
    HttpClientConfig::builder()
        .max_retries(max_retries)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .unwrap()
}
