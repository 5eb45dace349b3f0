//! HTTP webhook stages.
//!
//! Both stage kinds POST (method configurable) the JSON-encoded payload to
//! an external endpoint and surface the reply's `errors` and `warnings`
//! lists. The mutator flavour additionally expects an RFC 6902 JSON-Patch
//! under `patch`, applied to the job document.
//!
//! When the request context carries a client address or accessor ID the
//! call is annotated with `X-Forwarded-For`, `NACP-Client-IP` and
//! `NACP-Accessor-ID` so the hook can make caller-aware decisions.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{AdmissionError, Mutation, Mutator, Payload, Validator};
use crate::config::ConfigError;
use crate::multierror::MultiError;
use crate::nomad::Job;
use crate::TRANSPORT_TIMEOUT;

#[derive(Debug, Deserialize)]
struct ValidatorReply {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MutatorReply {
    #[serde(default)]
    patch: Value,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

fn build_client() -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(TRANSPORT_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::Webhook {
            reason: e.to_string(),
        })
}

fn parse_endpoint(name: &str, endpoint: &str) -> Result<Url, ConfigError> {
    Url::parse(endpoint).map_err(|e| ConfigError::InvalidUrl {
        url: endpoint.to_string(),
        reason: format!("webhook endpoint for stage '{name}': {e}"),
    })
}

fn parse_method(name: &str, method: &str) -> Result<Method, ConfigError> {
    Method::from_bytes(method.as_bytes()).map_err(|_| ConfigError::Webhook {
        reason: format!("invalid webhook method '{method}' for stage '{name}'"),
    })
}

async fn call_webhook<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    name: &str,
    method: &Method,
    endpoint: &Url,
    payload: &Payload,
) -> Result<T, AdmissionError> {
    let mut request = client
        .request(method.clone(), endpoint.clone())
        .json(payload);

    if let Some(ctx) = &payload.context {
        if !ctx.client_ip.is_empty() {
            request = request
                .header("X-Forwarded-For", ctx.client_ip.as_str())
                .header("NACP-Client-IP", ctx.client_ip.as_str());
        }
        if !ctx.accessor_id.is_empty() {
            request = request.header("NACP-Accessor-ID", ctx.accessor_id.as_str());
        }
    }

    let response = request
        .send()
        .await
        .map_err(|e| AdmissionError::Transport {
            stage: name.to_string(),
            reason: e.to_string(),
        })?;

    response
        .json::<T>()
        .await
        .map_err(|e| AdmissionError::InvalidReply {
            stage: name.to_string(),
            reason: e.to_string(),
        })
}

/// Validator backed by an external HTTP endpoint.
///
/// A reply with a non-empty `errors` list rejects the job; `warnings` are
/// passed upward unchanged.
pub struct WebhookValidator {
    name: String,
    endpoint: Url,
    method: Method,
    client: reqwest::Client,
}

impl WebhookValidator {
    pub fn new(name: &str, endpoint: &str, method: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.to_string(),
            endpoint: parse_endpoint(name, endpoint)?,
            method: parse_method(name, method)?,
            client: build_client()?,
        })
    }
}

#[async_trait]
impl Validator for WebhookValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, payload: &Payload) -> Result<Vec<String>, AdmissionError> {
        let reply: ValidatorReply = call_webhook(
            &self.client,
            &self.name,
            &self.method,
            &self.endpoint,
            payload,
        )
        .await?;

        if !reply.errors.is_empty() {
            return Err(AdmissionError::Rejected {
                stage: self.name.clone(),
                errors: MultiError::new(reply.errors),
            });
        }

        if !reply.warnings.is_empty() {
            debug!(
                stage = %self.name,
                job = payload.job.id_str(),
                warnings = ?reply.warnings,
                "webhook returned warnings"
            );
        }
        Ok(reply.warnings)
    }
}

/// Mutator backed by an external HTTP endpoint returning a JSON-Patch.
///
/// The patch is applied to the JSON encoding of the payload's job and the
/// result decoded back into a job. Decode, patch-parse and patch-apply
/// failures are all hard errors.
pub struct JsonPatchWebhookMutator {
    name: String,
    endpoint: Url,
    method: Method,
    client: reqwest::Client,
}

impl JsonPatchWebhookMutator {
    pub fn new(name: &str, endpoint: &str, method: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.to_string(),
            endpoint: parse_endpoint(name, endpoint)?,
            method: parse_method(name, method)?,
            client: build_client()?,
        })
    }
}

#[async_trait]
impl Mutator for JsonPatchWebhookMutator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mutate(&self, payload: &Payload) -> Result<Mutation, AdmissionError> {
        let reply: MutatorReply = call_webhook(
            &self.client,
            &self.name,
            &self.method,
            &self.endpoint,
            payload,
        )
        .await?;

        if !reply.errors.is_empty() {
            return Err(AdmissionError::Rejected {
                stage: self.name.clone(),
                errors: MultiError::new(reply.errors),
            });
        }

        let job = apply_patch(&self.name, &payload.job, reply.patch)?;
        if job.is_some() {
            debug!(stage = %self.name, job = payload.job.id_str(), "applied webhook patch");
        }

        Ok(Mutation {
            job,
            warnings: reply.warnings,
        })
    }
}

/// Apply a JSON-Patch value to a job. A `null` or empty patch is a no-op.
pub(super) fn apply_patch(
    stage: &str,
    job: &Job,
    patch_value: Value,
) -> Result<Option<Job>, AdmissionError> {
    if patch_value.is_null() || patch_value.as_array().is_some_and(Vec::is_empty) {
        return Ok(None);
    }

    let invalid = |reason: String| AdmissionError::InvalidPatch {
        stage: stage.to_string(),
        reason,
    };

    let patch: json_patch::Patch =
        serde_json::from_value(patch_value).map_err(|e| invalid(e.to_string()))?;

    let mut doc = serde_json::to_value(job).map_err(|e| invalid(e.to_string()))?;
    json_patch::patch(&mut doc, &patch).map_err(|e| invalid(e.to_string()))?;

    let patched: Job = serde_json::from_value(doc).map_err(|e| invalid(e.to_string()))?;
    Ok(Some(patched))
}
