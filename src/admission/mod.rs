//! Admission controllers: the mutator/validator contracts and their
//! built-in implementations.
//!
//! A *mutator* may return a rewritten job; a *validator* may reject the job
//! (hard error) or annotate it with warnings. Stage instances are shared
//! across requests and must not retain references to a payload after
//! returning; all per-request state travels inside [`Payload`].

mod factory;
mod notation;
mod opa;
mod pipeline;
mod webhook;

pub use factory::{build_mutators, build_validators};
pub use notation::{ImageSignatureValidator, ImageVerifier, ImageVerifyError, NotationVerifier};
pub use opa::{OpaJsonPatchMutator, OpaValidator};
pub use pipeline::{AdmissionResult, Pipeline, ValidatorVerdict};
pub use webhook::{JsonPatchWebhookMutator, WebhookValidator};

use async_trait::async_trait;
use serde::Serialize;

use crate::context::RequestContext;
use crate::multierror::MultiError;
use crate::nomad::Job;

/// The unit of work flowing through the pipeline: the current job plus the
/// read-only request context. This is also the wire format POSTed to
/// webhook stages.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    #[serde(rename = "Job")]
    pub job: Job,

    #[serde(rename = "Context", skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
}

impl Payload {
    pub fn new(job: Job, context: Option<RequestContext>) -> Self {
        Self { job, context }
    }
}

/// The outcome of a mutator invocation.
#[derive(Debug, Default)]
pub struct Mutation {
    /// The rewritten job, or `None` for a no-op (downstream stages keep
    /// seeing the previous job).
    pub job: Option<Job>,

    /// Non-fatal diagnostics to surface to the client.
    pub warnings: Vec<String>,
}

impl Mutation {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn new(job: Job) -> Self {
        Self {
            job: Some(job),
            warnings: Vec::new(),
        }
    }
}

/// A hard failure from an admission stage.
///
/// On the register and plan routes any of these stops the request before it
/// reaches Nomad. On the validate route a validator failure is captured and
/// reported through the upstream reply instead.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// A stage rejected the job outright.
    #[error("stage {stage} rejected the job:\n{errors}")]
    Rejected { stage: String, errors: MultiError },

    /// An outbound call to a webhook stage failed.
    #[error("stage {stage}: webhook call failed: {reason}")]
    Transport { stage: String, reason: String },

    /// A stage replied with something the proxy could not decode.
    #[error("stage {stage}: undecodable reply: {reason}")]
    InvalidReply { stage: String, reason: String },

    /// A mutator produced a patch that could not be parsed or applied, or
    /// the patched document no longer decodes as a job.
    #[error("stage {stage}: patch could not be applied: {reason}")]
    InvalidPatch { stage: String, reason: String },

    /// Policy rule evaluation failed (not a rejection; the rule itself
    /// errored).
    #[error("stage {stage}: rule evaluation failed: {reason}")]
    Evaluation { stage: String, reason: String },

    /// One or more container images failed signature verification.
    #[error("stage {stage}: image signature verification failed:\n{errors}")]
    SignatureVerification { stage: String, errors: MultiError },
}

impl AdmissionError {
    /// Flatten the error into the individual messages surfaced through a
    /// validate response's `ValidationErrors` list.
    pub fn validation_errors(&self) -> Vec<String> {
        match self {
            AdmissionError::Rejected { errors, .. }
            | AdmissionError::SignatureVerification { errors, .. } => errors.errors().to_vec(),
            other => vec![other.to_string()],
        }
    }
}

/// A named stage that may rewrite the job.
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Stage name, used for logging and error attribution.
    fn name(&self) -> &str;

    /// Inspect the payload and return a rewritten job and/or warnings.
    async fn mutate(&self, payload: &Payload) -> Result<Mutation, AdmissionError>;
}

/// A named stage that may reject the job or attach warnings.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Stage name, used for logging and error attribution.
    fn name(&self) -> &str;

    /// Inspect the payload and return warnings, or a hard error to reject.
    async fn validate(&self, payload: &Payload) -> Result<Vec<String>, AdmissionError>;
}
