//! Registry client: manifests and (range) blob fetches.
//!
//! Talks the OCI distribution protocol directly over `reqwest` so blob
//! fetches can start at an arbitrary compressed offset.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use oci_spec::image::{Arch, ImageIndex, ImageManifest, Os};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, RANGE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};

use super::auth::{Credential, CredentialSource};
use super::reference::{ImageReference, RepositoryRef};

/// Stream of compressed blob bytes.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json";

/// A layer as listed in an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
}

impl LayerDescriptor {
    /// Only gzip-compressed tar layers can be indexed and seeked.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.media_type.contains("gzip") {
            Ok(())
        } else {
            Err(StrataError::UnsupportedMediaType(format!(
                "{} (layer {})",
                self.media_type, self.digest
            )))
        }
    }
}

/// Resolved image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifestInfo {
    pub manifest_digest: String,
    /// Layers, bottom first
    pub layers: Vec<LayerDescriptor>,
}

impl ImageManifestInfo {
    pub(crate) fn from_oci(manifest: &ImageManifest, manifest_digest: String) -> Self {
        let layers = manifest
            .layers()
            .iter()
            .map(|layer| LayerDescriptor {
                digest: layer.digest().to_string(),
                media_type: layer.media_type().to_string(),
                size: layer.size() as u64,
            })
            .collect();
        Self {
            manifest_digest,
            layers,
        }
    }
}

/// Source of manifests and compressed layer blobs.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve an image reference to its manifest (manifest lists resolve to
    /// the linux entry matching the host architecture).
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<ImageManifestInfo>;

    /// Stream a blob starting at compressed byte `offset`.
    async fn fetch_blob(&self, repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream>;

    /// Path of the blob when it already is a local file.
    fn local_blob_path(&self, _repo: &RepositoryRef, _digest: &str) -> Option<PathBuf> {
        None
    }
}

/// Pick the linux manifest matching the host architecture.
///
/// Images always run as linux containers regardless of the host OS.
pub(crate) fn linux_platform_manifest(index: &ImageIndex) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    let arch = Arch::from(arch);

    index
        .manifests()
        .iter()
        .find(|entry| {
            entry
                .platform()
                .as_ref()
                .map_or(false, |p| *p.os() == Os::Linux && *p.architecture() == arch)
        })
        .map(|entry| entry.digest().to_string())
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."` style headers.
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = match header.split_once(' ') {
        Some((s, r)) => (s, r),
        None => (header, ""),
    };
    if scheme.is_empty() {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ') | Some(',')) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_lowercase(), value);
    }

    Some(Challenge {
        scheme: scheme.to_lowercase(),
        params,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client over HTTP(S).
pub struct HttpRegistryClient {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    plain_http: Vec<String>,
    /// Authorization header per `registry|scope`
    tokens: DashMap<String, HeaderValue>,
}

impl HttpRegistryClient {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            plain_http: Vec::new(),
            tokens: DashMap::new(),
        }
    }

    /// Hosts reached over plain HTTP instead of HTTPS.
    pub fn with_plain_http(mut self, hosts: Vec<String>) -> Self {
        self.plain_http = hosts;
        self
    }

    fn base_url(&self, registry: &str) -> String {
        let host = if registry == "docker.io" || registry == "index.docker.io" {
            "registry-1.docker.io"
        } else {
            registry
        };
        let plain = self.plain_http.iter().any(|h| h == registry)
            || host.starts_with("localhost")
            || host.starts_with("127.0.0.1");
        let scheme = if plain { "http" } else { "https" };
        format!("{}://{}", scheme, host)
    }

    fn unreachable(registry: &str, message: impl std::fmt::Display) -> StrataError {
        StrataError::RegistryUnreachable {
            registry: registry.to_string(),
            message: message.to_string(),
        }
    }

    /// Send a request, answering one authentication challenge if needed.
    async fn send(
        &self,
        repo: &RepositoryRef,
        method: Method,
        url: &str,
        headers: &[(reqwest::header::HeaderName, String)],
    ) -> Result<reqwest::Response> {
        let scope = format!("repository:{}:pull", repo.repository);
        let token_key = format!("{}|{}", repo.registry, scope);

        let build = |auth: Option<HeaderValue>| {
            let mut request = self.client.request(method.clone(), url);
            for (name, value) in headers {
                request = request.header(name.clone(), value.as_str());
            }
            if let Some(auth) = auth {
                request = request.header(AUTHORIZATION, auth);
            }
            request
        };

        let cached = self.tokens.get(&token_key).map(|v| v.clone());
        let had_cached = cached.is_some();
        let response = build(cached)
            .send()
            .await
            .map_err(|e| Self::unreachable(&repo.registry, e))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| StrataError::RegistryUnauthorized {
                registry: repo.registry.clone(),
                message: "401 without a usable WWW-Authenticate challenge".to_string(),
            })?;

        if had_cached {
            tracing::debug!(registry = %repo.registry, "Cached registry token rejected, re-authenticating");
            self.tokens.remove(&token_key);
        }

        let auth = self.authenticate(&repo.registry, &scope, &challenge).await?;
        self.tokens.insert(token_key, auth.clone());

        let response = build(Some(auth))
            .send()
            .await
            .map_err(|e| Self::unreachable(&repo.registry, e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(StrataError::RegistryUnauthorized {
                    registry: repo.registry.clone(),
                    message: format!("{} after authentication", response.status()),
                })
            }
            _ => Ok(response),
        }
    }

    /// Turn a challenge into an `Authorization` header value.
    async fn authenticate(
        &self,
        registry: &str,
        scope: &str,
        challenge: &Challenge,
    ) -> Result<HeaderValue> {
        let credential = self.credentials.resolve(registry, scope).await?;

        let header = match challenge.scheme.as_str() {
            "basic" => match credential {
                Some(Credential::Basic { username, password }) => basic_header(&username, &password),
                _ => {
                    return Err(StrataError::RegistryUnauthorized {
                        registry: registry.to_string(),
                        message: "basic authentication required but no credentials found"
                            .to_string(),
                    })
                }
            },
            "bearer" => {
                let token = self
                    .fetch_token(registry, scope, challenge, credential)
                    .await?;
                format!("Bearer {}", token)
            }
            other => {
                return Err(StrataError::RegistryUnauthorized {
                    registry: registry.to_string(),
                    message: format!("unsupported auth scheme {}", other),
                })
            }
        };

        HeaderValue::from_str(&header).map_err(|e| StrataError::RegistryUnauthorized {
            registry: registry.to_string(),
            message: format!("invalid authorization header: {}", e),
        })
    }

    async fn fetch_token(
        &self,
        registry: &str,
        scope: &str,
        challenge: &Challenge,
        credential: Option<Credential>,
    ) -> Result<String> {
        let realm = challenge.params.get("realm").ok_or_else(|| {
            StrataError::RegistryUnauthorized {
                registry: registry.to_string(),
                message: "bearer challenge without realm".to_string(),
            }
        })?;
        let service = challenge.params.get("service").cloned().unwrap_or_default();
        let scope = challenge
            .params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| scope.to_string());

        let request = match credential {
            Some(Credential::IdentityToken(refresh_token)) => self.client.post(realm).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("service", service.as_str()),
                ("scope", scope.as_str()),
                ("client_id", "strata"),
            ]),
            Some(Credential::Basic { username, password }) => self
                .client
                .get(realm)
                .query(&[("service", &service), ("scope", &scope)])
                .basic_auth(username, Some(password)),
            None => self
                .client
                .get(realm)
                .query(&[("service", &service), ("scope", &scope)]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Self::unreachable(registry, e))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StrataError::RegistryUnauthorized {
                registry: registry.to_string(),
                message: format!("token endpoint returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(Self::unreachable(
                registry,
                format!("token endpoint returned {}", status),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Self::unreachable(registry, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| StrataError::RegistryUnauthorized {
                registry: registry.to_string(),
                message: "token endpoint returned no token".to_string(),
            })
    }

    fn check_status(registry: &str, what: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StrataError::RegistryUnauthorized {
                registry: registry.to_string(),
                message: format!("{} returned {}", what, status),
            });
        }
        Err(Self::unreachable(registry, format!("{} returned {}", what, status)))
    }

    async fn get_manifest(
        &self,
        repo: &RepositoryRef,
        reference: &str,
    ) -> Result<(Bytes, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&repo.registry),
            repo.repository,
            reference
        );
        let response = self
            .send(repo, Method::GET, &url, &[(ACCEPT, MANIFEST_ACCEPT.to_string())])
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StrataError::InvalidReference(format!(
                "manifest {} not found in {}",
                reference, repo
            )));
        }
        Self::check_status(&repo.registry, "manifest fetch", response.status())?;

        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::unreachable(&repo.registry, e))?;
        let digest = header_digest
            .unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(&body))));
        Ok((body, digest))
    }
}

fn basic_header(username: &str, password: &str) -> String {
    use base64::Engine;
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<ImageManifestInfo> {
        let repo = reference.repository_ref();
        let (body, digest) = self
            .get_manifest(&repo, reference.manifest_reference())
            .await?;

        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let (body, digest) = if value.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_slice(&body)?;
            let platform_digest = linux_platform_manifest(&index).ok_or_else(|| {
                StrataError::InvalidReference(format!(
                    "{} has no linux/{} manifest",
                    reference,
                    std::env::consts::ARCH
                ))
            })?;
            tracing::debug!(reference = %reference, digest = %platform_digest, "Resolved platform manifest");
            self.get_manifest(&repo, &platform_digest).await?
        } else {
            (body, digest)
        };

        let manifest: ImageManifest = serde_json::from_slice(&body)?;
        Ok(ImageManifestInfo::from_oci(&manifest, digest))
    }

    async fn fetch_blob(&self, repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&repo.registry),
            repo.repository,
            digest
        );
        let headers = if offset > 0 {
            vec![(RANGE, format!("bytes={}-", offset))]
        } else {
            Vec::new()
        };
        let response = self.send(repo, Method::GET, &url, &headers).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StrataError::LayerNotFound {
                digest: digest.to_string(),
            });
        }
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Offset at or past the end of the blob
            return Ok(futures::stream::empty().boxed());
        }
        Self::check_status(&repo.registry, "blob fetch", status)?;

        let registry = repo.registry.clone();
        let stream = response
            .bytes_stream()
            .map_err(move |e| Self::unreachable(&registry, e))
            .boxed();

        if offset > 0 && status == StatusCode::OK {
            tracing::debug!(registry = %repo.registry, digest = %digest, offset, "Registry ignored range request");
            return Ok(skip_prefix(stream, offset));
        }
        Ok(stream)
    }
}

/// Drop the first `skip` bytes of a stream.
pub(crate) fn skip_prefix(stream: BlobStream, skip: u64) -> BlobStream {
    stream
        .scan(skip, |remaining, item| {
            let item = item.map(|mut chunk| {
                let len = chunk.len() as u64;
                if *remaining >= len {
                    *remaining -= len;
                    Bytes::new()
                } else {
                    let tail = chunk.split_off(*remaining as usize);
                    *remaining = 0;
                    tail
                }
            });
            futures::future::ready(Some(item))
        })
        .try_filter(|chunk| futures::future::ready(!chunk.is_empty()))
        .boxed()
}

/// Dispatches registry operations by registry name.
///
/// Registries without a dedicated route go to the fallback client.
pub struct RegistryRouter {
    routes: HashMap<String, Arc<dyn RegistryClient>>,
    fallback: Arc<dyn RegistryClient>,
}

impl RegistryRouter {
    pub fn new(fallback: Arc<dyn RegistryClient>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// HTTP registries plus local OCI layouts.
    pub fn standard(credentials: Arc<dyn CredentialSource>, plain_http: Vec<String>) -> Self {
        let http = HttpRegistryClient::new(credentials).with_plain_http(plain_http);
        Self::new(Arc::new(http)).route(
            super::layout::LAYOUT_REGISTRY,
            Arc::new(super::layout::LayoutRegistry::new()),
        )
    }

    pub fn route(mut self, registry: impl Into<String>, client: Arc<dyn RegistryClient>) -> Self {
        self.routes.insert(registry.into(), client);
        self
    }

    fn client(&self, registry: &str) -> &Arc<dyn RegistryClient> {
        self.routes.get(registry).unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl RegistryClient for RegistryRouter {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<ImageManifestInfo> {
        self.client(&reference.registry).fetch_manifest(reference).await
    }

    async fn fetch_blob(&self, repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream> {
        self.client(&repo.registry).fetch_blob(repo, digest, offset).await
    }

    fn local_blob_path(&self, repo: &RepositoryRef, digest: &str) -> Option<PathBuf> {
        self.client(&repo.registry).local_blob_path(repo, digest)
    }
}
