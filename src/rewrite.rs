//! Body rewriting on the intercepted routes.
//!
//! Intercepted bodies are never streamed: the request side buffers, decodes
//! the envelope, runs the pipeline and re-encodes; the response side merges
//! the pipeline's side outputs into the upstream reply, transparently
//! re-compressing when the upstream chose gzip.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::HeaderMap;
use tracing::debug;

use crate::admission::{Payload, Pipeline};
use crate::context::{AdmissionReport, RequestContext};
use crate::error::ProxyError;
use crate::multierror::merge_multierror_warnings;
use crate::nomad::{
    JobPlanRequest, JobPlanResponse, JobRegisterRequest, JobRegisterResponse, JobValidateRequest,
    JobValidateResponse,
};
use crate::routes::RouteClass;

fn decode_err(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::DecodeRequest(e.to_string())
}

fn encode_err(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::EncodeRequest(e.to_string())
}

/// Run the pipeline over an intercepted request body.
///
/// Returns the re-encoded body to forward plus the [`AdmissionReport`] the
/// response rewriter reads back. A hard error on the register and plan
/// routes (or from a mutator on the validate route) aborts the forward; a
/// validator rejection on the validate route is captured in the report
/// instead.
pub async fn admit_request(
    route: RouteClass,
    body: &[u8],
    context: RequestContext,
    pipeline: &Pipeline,
) -> Result<(Vec<u8>, AdmissionReport), ProxyError> {
    match route {
        RouteClass::Register => {
            let mut envelope: JobRegisterRequest =
                serde_json::from_slice(body).map_err(decode_err)?;
            let job = take_job(envelope.job.take())?;

            let result = pipeline
                .apply_admission_controllers(Payload::new(job, Some(context)))
                .await?;
            envelope.job = Some(result.job);

            let data = serde_json::to_vec(&envelope).map_err(encode_err)?;
            debug!(body = %String::from_utf8_lossy(&data), "job after admission controllers");
            Ok((
                data,
                AdmissionReport {
                    warnings: result.warnings,
                    validation_error: None,
                },
            ))
        }

        RouteClass::Plan => {
            let mut envelope: JobPlanRequest = serde_json::from_slice(body).map_err(decode_err)?;
            let job = take_job(envelope.job.take())?;

            let result = pipeline
                .apply_admission_controllers(Payload::new(job, Some(context)))
                .await?;
            envelope.job = Some(result.job);

            let data = serde_json::to_vec(&envelope).map_err(encode_err)?;
            debug!(body = %String::from_utf8_lossy(&data), "job after admission controllers");
            Ok((
                data,
                AdmissionReport {
                    warnings: result.warnings,
                    validation_error: None,
                },
            ))
        }

        RouteClass::Validate => {
            let mut envelope: JobValidateRequest =
                serde_json::from_slice(body).map_err(decode_err)?;
            let job = take_job(envelope.job.take())?;

            // A mutator failure still aborts; only validator rejections are
            // reported through the upstream reply.
            let mutated = pipeline
                .admission_mutators(Payload::new(job, Some(context.clone())))
                .await?;
            envelope.job = Some(mutated.job.clone());

            let verdict = pipeline
                .admission_validators(&Payload::new(mutated.job, Some(context)))
                .await;

            let mut warnings = mutated.warnings;
            warnings.extend(verdict.warnings);

            let data = serde_json::to_vec(&envelope).map_err(encode_err)?;
            Ok((
                data,
                AdmissionReport {
                    warnings,
                    validation_error: verdict.rejection,
                },
            ))
        }

        RouteClass::Passthrough => Ok((body.to_vec(), AdmissionReport::default())),
    }
}

fn take_job<T>(job: Option<T>) -> Result<T, ProxyError> {
    job.ok_or_else(|| ProxyError::DecodeRequest("request envelope has no job".to_string()))
}

/// Merge upstream and local warnings into Nomad's single warning string.
///
/// A non-empty upstream `Warnings` value is folded in as one warning ahead
/// of the local ones.
fn build_full_warning(upstream: &str, local: &[String]) -> String {
    let mut all = Vec::with_capacity(local.len() + 1);
    if !upstream.is_empty() {
        all.push(upstream.to_string());
    }
    all.extend_from_slice(local);
    merge_multierror_warnings(&all)
}

/// Rewrite an upstream reply body per route, handling gzip transparently.
///
/// The caller only invokes this when the report demands it
/// ([`AdmissionReport::requires_rewrite`]); untouched replies stream
/// through. Content encodings other than gzip reach the JSON decoder as-is.
pub fn rewrite_response(
    route: RouteClass,
    report: &AdmissionReport,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Bytes, ProxyError> {
    let rewrite_err = |e: &dyn std::fmt::Display| ProxyError::RewriteResponse(e.to_string());

    let is_gzip = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|enc| enc == "gzip");

    let decoded;
    let identity: &[u8] = if is_gzip {
        decoded = gunzip(body).map_err(|e| rewrite_err(&e))?;
        &decoded
    } else {
        body
    };

    let rewritten = rewrite_identity_body(route, report, identity)?;

    if is_gzip {
        Ok(Bytes::from(gzip(&rewritten).map_err(|e| rewrite_err(&e))?))
    } else {
        Ok(Bytes::from(rewritten))
    }
}

fn rewrite_identity_body(
    route: RouteClass,
    report: &AdmissionReport,
    body: &[u8],
) -> Result<Vec<u8>, ProxyError> {
    let rewrite_err = |e: &dyn std::fmt::Display| ProxyError::RewriteResponse(e.to_string());

    match route {
        RouteClass::Register => {
            let mut response: JobRegisterResponse =
                serde_json::from_slice(body).map_err(|e| rewrite_err(&e))?;
            response.warnings = build_full_warning(&response.warnings, &report.warnings);
            serde_json::to_vec(&response).map_err(|e| rewrite_err(&e))
        }

        RouteClass::Plan => {
            let mut response: JobPlanResponse =
                serde_json::from_slice(body).map_err(|e| rewrite_err(&e))?;
            response.warnings = build_full_warning(&response.warnings, &report.warnings);
            serde_json::to_vec(&response).map_err(|e| rewrite_err(&e))
        }

        RouteClass::Validate => {
            let mut response: JobValidateResponse =
                serde_json::from_slice(body).map_err(|e| rewrite_err(&e))?;

            if let Some(rejection) = &report.validation_error {
                response.validation_errors = rejection.validation_errors();
                response.error = rejection.to_string();
            }
            if !report.warnings.is_empty() {
                response.warnings = build_full_warning(&response.warnings, &report.warnings);
            }
            serde_json::to_vec(&response).map_err(|e| rewrite_err(&e))
        }

        RouteClass::Passthrough => Ok(body.to_vec()),
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
