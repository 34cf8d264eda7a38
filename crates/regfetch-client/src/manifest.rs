use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    digest::ImageDigest,
    error::{ClientError, ParseKind, Result},
};

pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
}

/// Manifest media types offered in `Accept`, in order of preference.
pub const MANIFEST_ACCEPT: [&str; 4] = [
    media_types::OCI_MANIFEST,
    media_types::DOCKER_MANIFEST,
    media_types::OCI_INDEX,
    media_types::DOCKER_MANIFEST_LIST,
];

/// Coarse classification of content, used to route blobs to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Manifest,
    Config,
    Layer,
    Other,
}

impl ContentKind {
    pub fn from_media_type(media_type: &str) -> Self {
        let media_type = media_type.to_ascii_lowercase();
        if media_type.contains("manifest") || media_type.contains("index") {
            ContentKind::Manifest
        } else if media_type.contains("config") || media_type.contains("container.image") {
            ContentKind::Config
        } else if media_type.contains("layer") || media_type.contains("tar") {
            ContentKind::Layer
        } else {
            ContentKind::Other
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentKind::Manifest => "manifest",
            ContentKind::Config => "config",
            ContentKind::Layer => "layer",
            ContentKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// `variant` only has to match when one is asked for.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        self.os == os
            && self.architecture == architecture
            && variant.is_none_or(|v| self.variant.as_deref() == Some(v))
    }
}

/// A content reference inside a manifest or index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: ImageDigest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn kind(&self) -> ContentKind {
        ContentKind::from_media_type(&self.media_type)
    }

    pub fn title(&self) -> Option<&str> {
        self.annotations
            .get("org.opencontainers.image.title")
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ManifestIndex {
    /// Entry for the given platform, else the first entry.
    pub fn select(
        &self,
        os: &str,
        architecture: &str,
        variant: Option<&str>,
    ) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| {
                d.platform
                    .as_ref()
                    .is_some_and(|p| p.matches(os, architecture, variant))
            })
            .or_else(|| self.manifests.first())
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ManifestIndex),
}

impl Manifest {
    /// Parses manifest bytes. The document's own `mediaType` wins over
    /// `content_type`; without either, the shape of the JSON decides.
    pub fn parse(content_type: Option<&str>, bytes: &[u8]) -> Result<Self> {
        let malformed = |e: serde_json::Error| {
            ClientError::parse(ParseKind::Manifest, format!("malformed manifest: {e}"))
        };

        let value: Value = serde_json::from_slice(bytes).map_err(malformed)?;
        let object = value.as_object().ok_or_else(|| {
            ClientError::parse(ParseKind::Manifest, "manifest is not a JSON object")
        })?;

        if object.get("schemaVersion").and_then(Value::as_u64) != Some(2) {
            return Err(ClientError::parse(
                ParseKind::Manifest,
                "only schemaVersion 2 manifests are supported",
            ));
        }

        let media_type = object
            .get("mediaType")
            .and_then(Value::as_str)
            .or(content_type)
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_string());

        let is_index = match media_type.as_deref() {
            Some(media_types::OCI_INDEX | media_types::DOCKER_MANIFEST_LIST) => true,
            Some(media_types::OCI_MANIFEST | media_types::DOCKER_MANIFEST) => false,
            _ => object.contains_key("manifests"),
        };

        if is_index {
            serde_json::from_value(value)
                .map(Manifest::Index)
                .map_err(malformed)
        } else {
            serde_json::from_value(value)
                .map(Manifest::Image)
                .map_err(malformed)
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Image(m) => m.media_type.as_deref().unwrap_or(media_types::OCI_MANIFEST),
            Manifest::Index(i) => i.media_type.as_deref().unwrap_or(media_types::OCI_INDEX),
        }
    }

    pub fn config(&self) -> Option<&Descriptor> {
        match self {
            Manifest::Image(m) => Some(&m.config),
            Manifest::Index(_) => None,
        }
    }

    pub fn layers(&self) -> &[Descriptor] {
        match self {
            Manifest::Image(m) => &m.layers,
            Manifest::Index(_) => &[],
        }
    }

    pub fn as_index(&self) -> Option<&ManifestIndex> {
        match self {
            Manifest::Index(i) => Some(i),
            Manifest::Image(_) => None,
        }
    }
}

/// The image configuration blob. Only the commonly inspected fields are
/// typed; the runtime section is kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub rootfs: Value,
}

impl ImageConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ClientError::parse(ParseKind::Config, format!("malformed image config: {e}")))
    }
}

/// Outcome of a manifest fetch.
#[derive(Debug, Clone)]
pub struct ManifestResult {
    /// Digest of the bytes in `raw`.
    pub digest: ImageDigest,
    pub media_type: String,
    pub content_length: u64,
    pub manifest: Manifest,
    pub raw: Vec<u8>,
}

/// What a HEAD request reveals about a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    pub digest: ImageDigest,
    pub media_type: Option<String>,
    pub size: Option<u64>,
}

/// One page of a tag listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TagList {
    #[serde(rename = "name")]
    pub repository: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
    /// Cursor for the next page, taken from the `Link` header.
    #[serde(skip)]
    pub next: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_DIGEST: &str =
        "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7";
    const LAYER_DIGEST: &str =
        "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";
    const AMD64_DIGEST: &str =
        "sha256:fcde2b2edba56bf408601fb721fe9b5c338d10ee429ea04fae5511b68fbf8fb9";
    const ARM64_DIGEST: &str =
        "sha256:baa5a0964d3320fbc0c6a922140453c8513ea24ab8fd0577034804a967248096";

    fn image_manifest_json() -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{}",
                "config": {{"mediaType": "{}", "digest": "{CONFIG_DIGEST}", "size": 7023}},
                "layers": [
                    {{
                        "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                        "digest": "{LAYER_DIGEST}",
                        "size": 32654,
                        "annotations": {{"org.opencontainers.image.title": "rootfs.tar.gz"}}
                    }}
                ]
            }}"#,
            media_types::OCI_MANIFEST,
            media_types::OCI_CONFIG
        )
    }

    fn index_json() -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{}",
                "manifests": [
                    {{
                        "mediaType": "{}",
                        "digest": "{ARM64_DIGEST}",
                        "size": 528,
                        "platform": {{"architecture": "arm64", "os": "linux", "variant": "v8"}}
                    }},
                    {{
                        "mediaType": "{}",
                        "digest": "{AMD64_DIGEST}",
                        "size": 528,
                        "platform": {{"architecture": "amd64", "os": "linux"}}
                    }}
                ]
            }}"#,
            media_types::OCI_INDEX,
            media_types::OCI_MANIFEST,
            media_types::OCI_MANIFEST
        )
    }

    #[test]
    fn test_parse_image_manifest() {
        let manifest = Manifest::parse(None, image_manifest_json().as_bytes()).unwrap();

        assert_eq!(manifest.media_type(), media_types::OCI_MANIFEST);
        let config = manifest.config().unwrap();
        assert_eq!(config.digest.to_string(), CONFIG_DIGEST);
        assert_eq!(config.kind(), ContentKind::Config);

        let layers = manifest.layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].size, 32654);
        assert_eq!(layers[0].kind(), ContentKind::Layer);
        assert_eq!(layers[0].title(), Some("rootfs.tar.gz"));
    }

    #[test]
    fn test_parse_index_and_select_platform() {
        let manifest = Manifest::parse(None, index_json().as_bytes()).unwrap();
        let index = manifest.as_index().unwrap();
        assert!(manifest.config().is_none());

        let amd64 = index.select("linux", "amd64", None).unwrap();
        assert_eq!(amd64.digest.to_string(), AMD64_DIGEST);

        let arm64 = index.select("linux", "arm64", Some("v8")).unwrap();
        assert_eq!(arm64.digest.to_string(), ARM64_DIGEST);

        let fallback = index.select("windows", "amd64", None).unwrap();
        assert_eq!(fallback.digest.to_string(), ARM64_DIGEST);
    }

    #[test]
    fn test_index_detected_from_content_type_or_shape() {
        let body = index_json().replace(
            &format!("\"mediaType\": \"{}\",", media_types::OCI_INDEX),
            "",
        );
        let by_header = Manifest::parse(Some(media_types::DOCKER_MANIFEST_LIST), body.as_bytes());
        assert!(matches!(by_header, Ok(Manifest::Index(_))));

        let by_shape = Manifest::parse(None, body.as_bytes());
        assert!(matches!(by_shape, Ok(Manifest::Index(_))));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for body in [
            "not json",
            "[]",
            r#"{"schemaVersion": 1, "name": "legacy"}"#,
            r#"{"schemaVersion": 2, "layers": []}"#,
            r#"{"schemaVersion": 2, "config": {"mediaType": "x", "digest": "sha256:zz", "size": 1}}"#,
        ] {
            let err = Manifest::parse(None, body.as_bytes()).unwrap_err();
            assert!(
                matches!(
                    err,
                    ClientError::Parse {
                        kind: ParseKind::Manifest,
                        ..
                    }
                ),
                "{body}"
            );
        }
    }

    #[test]
    fn test_content_kind_from_media_type() {
        assert_eq!(
            ContentKind::from_media_type(media_types::DOCKER_MANIFEST),
            ContentKind::Manifest
        );
        assert_eq!(
            ContentKind::from_media_type(media_types::OCI_INDEX),
            ContentKind::Manifest
        );
        assert_eq!(
            ContentKind::from_media_type(media_types::DOCKER_CONFIG),
            ContentKind::Config
        );
        assert_eq!(
            ContentKind::from_media_type("application/vnd.docker.image.rootfs.diff.tar.gzip"),
            ContentKind::Layer
        );
        assert_eq!(
            ContentKind::from_media_type("application/octet-stream"),
            ContentKind::Other
        );
    }

    #[test]
    fn test_image_config() {
        let config = ImageConfig::parse(
            br#"{"architecture":"amd64","os":"linux","config":{"Env":["PATH=/bin"]},"rootfs":{"type":"layers"}}"#,
        )
        .unwrap();
        assert_eq!(config.architecture.as_deref(), Some("amd64"));
        assert_eq!(config.config["Env"][0], "PATH=/bin");

        let err = ImageConfig::parse(b"{").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Parse {
                kind: ParseKind::Config,
                ..
            }
        ));
    }

    #[test]
    fn test_tag_list_with_null_tags() {
        let list: TagList = serde_json::from_str(r#"{"name": "app", "tags": null}"#).unwrap();
        assert_eq!(list.repository, "app");
        assert!(list.tags.is_empty());
        assert!(list.next.is_none());
    }
}
