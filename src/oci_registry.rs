use crate::config::{RegistryConfig, RegistryCredentials};
use crate::error::Error;
use crate::image_reference::ImageReference;
use anyhow::Context;
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use tracing::{debug, info};

pub const DOCKER_CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Resolves the content digest currently behind an image tag.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve_digest(&self, image_reference: &ImageReference) -> Result<String, Error>;
}

pub fn create_client(config: &RegistryConfig) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder().timeout(config.timeout());

    for file_path in &config.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

struct CredentialMatcher {
    matcher: GlobMatcher,
    credentials: RegistryCredentials,
}

/// Manifest client speaking the registry v2 protocol with anonymous or
/// basic-credential bearer token exchange. Tokens are never cached between
/// calls.
pub struct RegistryClient {
    http: Client,
    insecure_registries: HashSet<String>,
    credentials: Vec<CredentialMatcher>,
}

impl RegistryClient {
    pub fn new(http: Client, config: &RegistryConfig) -> anyhow::Result<Self> {
        let credentials = config
            .credentials
            .iter()
            .map(|credentials| {
                let matcher = Glob::new(&credentials.hostname_pattern)
                    .with_context(|| {
                        format!(
                            "Invalid registry hostname pattern {}",
                            credentials.hostname_pattern
                        )
                    })?
                    .compile_matcher();
                Ok(CredentialMatcher {
                    matcher,
                    credentials: credentials.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            http,
            insecure_registries: config.insecure_registries.iter().cloned().collect(),
            credentials,
        })
    }

    fn find_credentials(&self, registry: &str) -> Option<&RegistryCredentials> {
        self.credentials
            .iter()
            .find(|c| c.matcher.is_match(registry))
            .map(|c| &c.credentials)
    }

    fn manifest_url(&self, image_reference: &ImageReference) -> String {
        let scheme = if self.insecure_registries.contains(&image_reference.registry) {
            "http"
        } else {
            "https"
        };
        format!(
            "{}://{}{}",
            scheme,
            image_reference.registry,
            image_reference.manifest_path()
        )
    }

    async fn fetch_manifest(
        &self,
        image_reference: &ImageReference,
        url: &str,
        token: Option<&str>,
    ) -> Result<Response, Error> {
        debug!("Fetching manifest from URL {}", url);
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES.join(", "));
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request.send().await.map_err(|e| Error::DigestFetch {
            image: image_reference.to_string(),
            reason: format!("request to {} failed: {}", url, e),
        })
    }

    async fn fetch_token(
        &self,
        image_reference: &ImageReference,
        challenge: &Challenge,
    ) -> Result<String, Error> {
        let auth_error = |reason: String| Error::Authentication {
            image: image_reference.to_string(),
            reason,
        };

        let realm = challenge
            .realm()
            .ok_or_else(|| auth_error("bearer challenge has no realm".to_string()))?;
        let scope = challenge
            .scope()
            .map(str::to_string)
            .unwrap_or_else(|| image_reference.pull_scope());

        let mut query = vec![("scope", scope)];
        if let Some(service) = challenge.service() {
            query.push(("service", service.to_string()));
        }

        debug!("Requesting bearer token from {} for {}", realm, image_reference);
        let mut request = self.http.get(realm).query(&query);
        if let Some(credentials) = self.find_credentials(&image_reference.registry) {
            request = request.basic_auth(
                &credentials.username,
                Some(credentials.password.expose_secret()),
            );
        }

        // A timeout is a fetch failure like any other, not a rejected login.
        let token_error = |e: reqwest::Error| {
            let reason = format!("token request to {} failed: {}", realm, e);
            if e.is_timeout() {
                Error::DigestFetch {
                    image: image_reference.to_string(),
                    reason,
                }
            } else {
                auth_error(reason)
            }
        };

        let response = request.send().await.map_err(token_error)?;
        if !response.status().is_success() {
            return Err(auth_error(format!(
                "token endpoint {} returned status {}",
                realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                token_error(e)
            } else {
                auth_error(format!("invalid token response from {}: {}", realm, e))
            }
        })?;

        body.into_token()
            .ok_or_else(|| auth_error(format!("token endpoint {} returned no token", realm)))
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve_digest(&self, image_reference: &ImageReference) -> Result<String, Error> {
        let url = self.manifest_url(image_reference);
        let mut response = self.fetch_manifest(image_reference, &url, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .and_then(Challenge::parse)
                .ok_or_else(|| Error::Authentication {
                    image: image_reference.to_string(),
                    reason: format!(
                        "registry {} did not issue a bearer challenge",
                        image_reference.registry
                    ),
                })?;
            let token = self.fetch_token(image_reference, &challenge).await?;
            response = self
                .fetch_manifest(image_reference, &url, Some(&token))
                .await?;
        }

        if !response.status().is_success() {
            return Err(Error::DigestFetch {
                image: image_reference.to_string(),
                reason: format!(
                    "registry {} returned status {} while fetching manifest",
                    image_reference.registry,
                    response.status()
                ),
            });
        }

        let digest = get_digest_from_response(&response).map_err(|reason| Error::DigestFetch {
            image: image_reference.to_string(),
            reason,
        })?;
        debug!("Resolved {} to digest {}", image_reference, digest);
        Ok(digest)
    }
}

fn get_digest_from_response(response: &Response) -> Result<String, String> {
    let value = response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .ok_or_else(|| {
            format!("response does not contain HTTP header {DOCKER_CONTENT_DIGEST_HEADER}")
        })?;
    let digest = value
        .to_str()
        .map_err(|_| format!("received invalid content in {DOCKER_CONTENT_DIGEST_HEADER} header"))?
        .trim();
    if digest.is_empty() {
        return Err(format!("{DOCKER_CONTENT_DIGEST_HEADER} header is empty"));
    }
    Ok(digest.to_string())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    params: HashMap<String, String>,
}

impl Challenge {
    /// Returns `None` for any scheme other than `Bearer`.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = params
            .split(',')
            .filter_map(|part| part.split_once('='))
            .map(|(key, value)| {
                (
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                )
            })
            .collect();

        Some(Self { params })
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    pub fn service(&self) -> Option<&str> {
        self.param("service")
    }

    pub fn scope(&self) -> Option<&str> {
        self.param("scope")
    }
}
