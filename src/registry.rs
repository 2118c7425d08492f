//! # Container Registry Access
//!
//! Speaks the Docker registry v2 HTTP protocol needed to pull an image:
//!
//! 1. **Token**: `GET <auth>?service=<service>&scope=repository:<repo>:pull`
//! 2. **Manifest**: `GET <registry>/v2/<repo>/manifests/<tag>` with the
//!    Docker v2 manifest media type in `Accept`
//! 3. **Blobs**: `GET <registry>/v2/<repo>/blobs/<digest>`, streamed to disk
//!
//! The transport sits behind [`RegistryTransport`] so the image pipeline can
//! be exercised against an in-memory registry in tests. [`HttpRegistry`] is
//! the `reqwest` implementation.
//!
//! ## Image References
//!
//! [`ImageReference::parse`] accepts both `"repo tag"` (the job file form)
//! and `"repo:tag"`. Parsing and Docker Hub normalization (`nginx` becomes
//! `library/nginx` on `docker.io`) are delegated to `oci-distribution`.
//!
//! ## Authentication
//!
//! Docker Hub references use the configured token endpoint. Other registries
//! are probed at `/v2/`: a `401` with a `Bearer` challenge names the token
//! endpoint, a `200` means anonymous access without a token.

use crate::config::RegistryConfig;
use crate::constants::{
    DEFAULT_IMAGE_TAG, DOCKER_HUB_REGISTRY, DOCKER_MANIFEST_V2_MEDIA_TYPE, MAX_IMAGE_REF_LEN,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use oci_distribution::Reference;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

// =============================================================================
// Image Reference
// =============================================================================

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, `docker.io` for Docker Hub.
    pub registry: String,
    /// Repository path, e.g. `library/nginx`.
    pub repository: String,
    /// Tag or `sha256:` digest.
    pub tag: String,
}

impl ImageReference {
    /// Parses `"repo tag"` or `"repo:tag"` (also `"repo@digest"`).
    ///
    /// A missing tag defaults to `latest`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if input.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }

        let mut parts = input.split_whitespace();
        let normalized = match (parts.next(), parts.next(), parts.next()) {
            (Some(repo), Some(tag), None) if tag.contains(':') => format!("{}@{}", repo, tag),
            (Some(repo), Some(tag), None) => format!("{}:{}", repo, tag),
            (Some(repo), None, _) => repo.to_string(),
            _ => return Err(invalid("expected \"repo tag\" or \"repo:tag\"")),
        };

        if !normalized.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || c == '/'
                || c == ':'
                || c == '.'
                || c == '-'
                || c == '_'
                || c == '@'
        }) {
            return Err(invalid("contains invalid characters"));
        }

        let reference: Reference = normalized
            .parse()
            .map_err(|e| invalid(&format!("{}", e)))?;

        let tag = reference
            .digest()
            .or_else(|| reference.tag())
            .unwrap_or(DEFAULT_IMAGE_TAG)
            .to_string();

        Ok(Self {
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            tag,
        })
    }

    /// Returns true if the reference resolves to Docker Hub.
    pub fn is_docker_hub(&self) -> bool {
        matches!(
            self.registry.as_str(),
            DOCKER_HUB_REGISTRY | "index.docker.io" | "registry-1.docker.io"
        )
    }

    /// Returns true if `tag` is a content digest rather than a tag name.
    pub fn is_digest(&self) -> bool {
        self.tag.contains(':')
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.tag)
    }
}

// =============================================================================
// Manifest Document
// =============================================================================

/// Content descriptor inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// Single-platform image manifest (Docker v2 schema 2 or OCI).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Parses a manifest body fetched for `reference`.
    pub fn from_slice(bytes: &[u8], reference: &ImageReference) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::ManifestFetchFailed {
            reference: reference.to_string(),
            reason: format!("invalid manifest: {}", e),
        })
    }

    /// Digest of the image configuration blob.
    pub fn config_digest(&self, reference: &ImageReference) -> Result<&str> {
        self.config
            .as_ref()
            .map(|c| c.digest.as_str())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::ConfigBlobMissing {
                reference: reference.to_string(),
            })
    }

    /// Layer digests in manifest order, bottom layer first.
    pub fn layer_digests(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.digest.as_str())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Registry operations used by the image pipeline.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Obtains a pull token; `None` means anonymous access.
    async fn token(&self, reference: &ImageReference) -> Result<Option<String>>;

    /// Fetches the raw manifest body.
    async fn manifest(&self, reference: &ImageReference, token: Option<&str>) -> Result<Vec<u8>>;

    /// Downloads blob `digest` to `dest`, returning the bytes written.
    async fn blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<u64>;
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// [`RegistryTransport`] over HTTPS with `reqwest`.
pub struct HttpRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        if reference.is_docker_hub() {
            self.config.url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", reference.registry)
        }
    }

    async fn request_token(
        &self,
        reference: &ImageReference,
        realm: &str,
        service: Option<&str>,
    ) -> Result<String> {
        let failed = |reason: String| Error::TokenFetchFailed {
            repository: reference.repository.clone(),
            reason,
        };
        let scope = format!("repository:{}:pull", reference.repository);
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = service {
            query.push(("service", service));
        }

        debug!("requesting pull token from {} for {}", realm, scope);
        let response = self
            .client
            .get(realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;

        let body: TokenResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| failed("response carries no token".to_string()))
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistry {
    async fn token(&self, reference: &ImageReference) -> Result<Option<String>> {
        if reference.is_docker_hub() {
            let token = self
                .request_token(reference, &self.config.auth_url, Some(&self.config.service))
                .await?;
            return Ok(Some(token));
        }

        let probe = format!("{}/v2/", self.base_url(reference));
        let response = self
            .client
            .get(&probe)
            .send()
            .await
            .map_err(|e| Error::TokenFetchFailed {
                repository: reference.repository.clone(),
                reason: e.to_string(),
            })?;

        if response.status().is_success() {
            return Ok(None);
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(Error::TokenFetchFailed {
                repository: reference.repository.clone(),
                reason: format!("unexpected status {} from {}", response.status(), probe),
            });
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| Error::TokenFetchFailed {
                repository: reference.repository.clone(),
                reason: "registry sent no bearer challenge".to_string(),
            })?;

        let token = self
            .request_token(reference, &challenge.realm, challenge.service.as_deref())
            .await?;
        Ok(Some(token))
    }

    async fn manifest(&self, reference: &ImageReference, token: Option<&str>) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::ManifestFetchFailed {
            reference: reference.to_string(),
            reason,
        };
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository,
            reference.tag
        );

        debug!("fetching manifest {}", url);
        let mut request = self.client.get(&url).header(
            ACCEPT,
            format!(
                "{}, {}",
                DOCKER_MANIFEST_V2_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE
            ),
        );
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;
        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        Ok(body.to_vec())
    }

    async fn blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<u64> {
        let failed = |reason: String| Error::BlobFetchFailed {
            digest: digest.to_string(),
            reason,
        };
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository,
            digest
        );

        debug!("fetching blob {}", url);
        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| failed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| failed(format!("create {}: {}", dest.display(), e)))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| failed(e.to_string()))?;

        Ok(written)
    }
}

// =============================================================================
// WWW-Authenticate
// =============================================================================

/// Parameters of a `Bearer` authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_space_form() {
        let r = ImageReference::parse("library/nginx 1.25").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "1.25");
    }

    #[test]
    fn test_parse_colon_form_adds_library_prefix() {
        let r = ImageReference::parse("nginx:latest").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
        assert!(r.is_docker_hub());
    }

    #[test]
    fn test_parse_default_tag() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn test_parse_other_registry() {
        let r = ImageReference::parse("ghcr.io/org/app:v2").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert!(!r.is_docker_hub());
    }

    #[test]
    fn test_parse_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("alpine {}", digest)).unwrap();
        assert_eq!(r.tag, digest);
        assert!(r.is_digest());
        assert!(r.to_string().contains('@'));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("a b c").is_err());
        assert!(ImageReference::parse("nginx;rm -rf").is_err());
        assert!(ImageReference::parse(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_manifest_parse() {
        let reference = ImageReference::parse("alpine").unwrap();
        let body = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"mediaType": "x", "digest": "sha256:c0", "size": 10},
            "layers": [{"digest": "sha256:l1"}, {"digest": "sha256:l2"}]
        }"#;
        let manifest = ImageManifest::from_slice(body, &reference).unwrap();
        assert_eq!(manifest.config_digest(&reference).unwrap(), "sha256:c0");
        assert_eq!(
            manifest.layer_digests().collect::<Vec<_>>(),
            vec!["sha256:l1", "sha256:l2"]
        );
    }

    #[test]
    fn test_manifest_without_config() {
        let reference = ImageReference::parse("alpine").unwrap();
        let manifest = ImageManifest::from_slice(br#"{"layers": []}"#, &reference).unwrap();
        assert!(matches!(
            manifest.config_digest(&reference),
            Err(Error::ConfigBlobMissing { .. })
        ));
    }

    #[test]
    fn test_manifest_garbage() {
        let reference = ImageReference::parse("alpine").unwrap();
        assert!(matches!(
            ImageManifest::from_slice(b"<html>", &reference),
            Err(Error::ManifestFetchFailed { .. })
        ));
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let c = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/app:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://ghcr.io/token");
        assert_eq!(c.service.as_deref(), Some("ghcr.io"));

        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_challenge(r#"Bearer service="x""#).is_none());
    }
}
