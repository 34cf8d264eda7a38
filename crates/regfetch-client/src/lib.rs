pub mod auth;
pub mod blob;
pub mod cache;
pub mod client;
pub mod digest;
pub mod error;
pub mod http;
pub mod http_client;
pub mod manifest;
pub mod p2p;
pub mod reference;

#[cfg(test)]
pub mod test_utils;

pub use blob::{BlobRequest, BlobResult, BlobSource};
pub use client::{RegistryClient, RegistryClientBuilder};
pub use digest::ImageDigest;
pub use error::{ClientError, ErrorCategory};
pub use reference::ImageRef;
