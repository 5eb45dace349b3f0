//! Image signature verification.
//!
//! The pipeline only owns the adapter side: [`verify_job_images`] walks the
//! job's task images and collects per-image failures into one hard error,
//! and [`ImageSignatureValidator`] exposes that as a validator stage. The
//! actual verification sits behind the [`ImageVerifier`] trait.
//!
//! [`NotationVerifier`] is the shipped implementation: it loads the
//! notation trust policy document, checks the trust store material at
//! startup, and verifies an image by resolving its digest and requiring at
//! least one notation-format signature via the registry's referrers API.
//! Trust-chain evaluation of the signature envelopes themselves is the
//! trust store owner's concern and happens outside this proxy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AdmissionError, Payload, Validator};
use crate::config::{ConfigError, NotationConfig};
use crate::multierror::MultiError;
use crate::nomad::Job;
use crate::TRANSPORT_TIMEOUT;

/// The artifact type notation uses when attaching signatures to an image.
const NOTATION_ARTIFACT_TYPE: &str = "application/vnd.cncf.notary.signature";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// A single image verification failure.
#[derive(Debug, thiserror::Error)]
#[error("image {image}: {reason}")]
pub struct ImageVerifyError {
    pub image: String,
    pub reason: String,
}

impl ImageVerifyError {
    fn new(image: &str, reason: impl Into<String>) -> Self {
        Self {
            image: image.to_string(),
            reason: reason.into(),
        }
    }
}

/// Verifies that a container image carries an acceptable signature.
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    async fn verify(&self, image: &str) -> Result<(), ImageVerifyError>;
}

/// Verify every image the job references; failures aggregate into one hard
/// error attributed to `stage`.
pub async fn verify_job_images(
    stage: &str,
    verifier: &dyn ImageVerifier,
    job: &Job,
) -> Result<(), AdmissionError> {
    let mut failures = Vec::new();
    for image in job.task_images() {
        match verifier.verify(&image).await {
            Ok(()) => debug!(stage, image = %image, "image signature verified"),
            Err(e) => failures.push(e.to_string()),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(AdmissionError::SignatureVerification {
            stage: stage.to_string(),
            errors: MultiError::new(failures),
        })
    }
}

/// Validator stage that only runs image verification.
pub struct ImageSignatureValidator {
    name: String,
    verifier: Arc<dyn ImageVerifier>,
}

impl ImageSignatureValidator {
    pub fn new(name: &str, verifier: Arc<dyn ImageVerifier>) -> Self {
        Self {
            name: name.to_string(),
            verifier,
        }
    }
}

#[async_trait]
impl Validator for ImageSignatureValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, payload: &Payload) -> Result<Vec<String>, AdmissionError> {
        verify_job_images(&self.name, self.verifier.as_ref(), &payload.job).await?;
        Ok(Vec::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Notation trust material
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustPolicyDocument {
    #[allow(dead_code)]
    version: String,
    trust_policies: Vec<TrustPolicyStatement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustPolicyStatement {
    #[allow(dead_code)]
    name: String,
    registry_scopes: Vec<String>,
}

/// Docker-style credential store: `{"auths": {"registry": {"auth": "..."}}}`.
#[derive(Debug, Default, Deserialize)]
struct CredentialStore {
    #[serde(default)]
    auths: HashMap<String, CredentialEntry>,
}

#[derive(Debug, Deserialize)]
struct CredentialEntry {
    #[serde(default)]
    auth: String,
}

#[derive(Debug, Deserialize)]
struct ReferrersIndex {
    #[serde(default)]
    manifests: Vec<serde_json::Value>,
}

/// A parsed image reference.
struct ImageRef {
    registry: String,
    repository: String,
    /// Digest (`sha256:…`) or tag.
    selector: Selector,
}

enum Selector {
    Digest(String),
    Tag(String),
}

fn parse_image_ref(image: &str) -> Result<ImageRef, String> {
    let (registry, remainder) = image
        .split_once('/')
        .filter(|(host, _)| host.contains('.') || host.contains(':') || *host == "localhost")
        .ok_or_else(|| "image reference must include a registry host".to_string())?;

    if let Some((repository, digest)) = remainder.split_once('@') {
        return Ok(ImageRef {
            registry: registry.to_string(),
            repository: repository.to_string(),
            selector: Selector::Digest(digest.to_string()),
        });
    }

    // A ':' after the last '/' separates the tag; earlier ones would belong
    // to the registry host, which was already split off.
    match remainder.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => {
            Ok(ImageRef {
                registry: registry.to_string(),
                repository: repository.to_string(),
                selector: Selector::Tag(tag.to_string()),
            })
        }
        _ => Ok(ImageRef {
            registry: registry.to_string(),
            repository: remainder.to_string(),
            selector: Selector::Tag("latest".to_string()),
        }),
    }
}

/// Signature presence verification against the image registry.
pub struct NotationVerifier {
    policy: TrustPolicyDocument,
    credentials: HashMap<String, String>,
    client: reqwest::Client,
    plain_http: bool,
    max_sig_attempts: usize,
}

impl NotationVerifier {
    pub fn from_config(config: &NotationConfig) -> Result<Self, ConfigError> {
        let notation_err = |reason: String| ConfigError::Notation { reason };

        let policy_raw = std::fs::read_to_string(&config.trust_policy_file).map_err(|e| {
            notation_err(format!(
                "reading trust policy {}: {e}",
                config.trust_policy_file
            ))
        })?;
        let policy: TrustPolicyDocument = serde_json::from_str(&policy_raw).map_err(|e| {
            notation_err(format!(
                "parsing trust policy {}: {e}",
                config.trust_policy_file
            ))
        })?;
        if policy.trust_policies.is_empty() {
            return Err(notation_err(format!(
                "trust policy {} defines no statements",
                config.trust_policy_file
            )));
        }

        if !Path::new(&config.trust_store_dir).is_dir() {
            return Err(notation_err(format!(
                "trust store directory {} does not exist",
                config.trust_store_dir
            )));
        }

        let credentials = match &config.credential_store_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| notation_err(format!("reading credential store {path}: {e}")))?;
                let store: CredentialStore = serde_json::from_str(&raw)
                    .map_err(|e| notation_err(format!("parsing credential store {path}: {e}")))?;
                store
                    .auths
                    .into_iter()
                    .filter(|(_, entry)| !entry.auth.is_empty())
                    .map(|(registry, entry)| (registry, entry.auth))
                    .collect()
            }
            None => HashMap::new(),
        };

        let client = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| notation_err(e.to_string()))?;

        Ok(Self {
            policy,
            credentials,
            client,
            plain_http: config.repo_plain_http,
            max_sig_attempts: config.max_sig_attempts,
        })
    }

    fn scope_trusted(&self, registry: &str, repository: &str) -> bool {
        let scope = format!("{registry}/{repository}");
        self.policy.trust_policies.iter().any(|statement| {
            statement
                .registry_scopes
                .iter()
                .any(|s| s == "*" || *s == scope)
        })
    }

    fn registry_url(&self, registry: &str, path: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{scheme}://{registry}/v2/{path}")
    }

    fn auth_request(&self, registry: &str, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.get(registry) {
            Some(auth) => request.header("Authorization", format!("Basic {auth}")),
            None => request,
        }
    }

    async fn resolve_digest(&self, image: &ImageRef) -> Result<String, String> {
        match &image.selector {
            Selector::Digest(digest) => Ok(digest.clone()),
            Selector::Tag(tag) => {
                let url = self.registry_url(
                    &image.registry,
                    &format!("{}/manifests/{tag}", image.repository),
                );
                let request = self
                    .client
                    .head(&url)
                    .header("Accept", MANIFEST_ACCEPT);
                let response = self
                    .auth_request(&image.registry, request)
                    .send()
                    .await
                    .map_err(|e| format!("resolving manifest digest: {e}"))?;

                if !response.status().is_success() {
                    return Err(format!(
                        "resolving manifest digest: registry returned {}",
                        response.status()
                    ));
                }

                response
                    .headers()
                    .get("Docker-Content-Digest")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| "registry reply carries no content digest".to_string())
            }
        }
    }
}

#[async_trait]
impl ImageVerifier for NotationVerifier {
    async fn verify(&self, image: &str) -> Result<(), ImageVerifyError> {
        let reference =
            parse_image_ref(image).map_err(|reason| ImageVerifyError::new(image, reason))?;

        if !self.scope_trusted(&reference.registry, &reference.repository) {
            return Err(ImageVerifyError::new(
                image,
                "no trust policy covers this registry scope",
            ));
        }

        let digest = self
            .resolve_digest(&reference)
            .await
            .map_err(|reason| ImageVerifyError::new(image, reason))?;

        let url = self.registry_url(
            &reference.registry,
            &format!("{}/referrers/{digest}", reference.repository),
        );
        let request = self
            .client
            .get(&url)
            .query(&[("artifactType", NOTATION_ARTIFACT_TYPE)]);
        let response = self
            .auth_request(&reference.registry, request)
            .send()
            .await
            .map_err(|e| ImageVerifyError::new(image, format!("listing signatures: {e}")))?;

        if !response.status().is_success() {
            return Err(ImageVerifyError::new(
                image,
                format!("listing signatures: registry returned {}", response.status()),
            ));
        }

        let index: ReferrersIndex = response
            .json()
            .await
            .map_err(|e| ImageVerifyError::new(image, format!("decoding referrers reply: {e}")))?;

        let signatures = index.manifests.len().min(self.max_sig_attempts);
        if signatures == 0 {
            return Err(ImageVerifyError::new(image, "no signature found"));
        }

        debug!(image, digest = %digest, signatures, "signature presence verified");
        Ok(())
    }
}
