//! Construction of admission stages from configuration.
//!
//! Each builder returns the stage list plus whether any stage asked for
//! token resolution; the proxy host ORs the two flags into the pipeline's
//! resolve-token switch. An unknown stage type fails startup.

use std::sync::Arc;

use tracing::info;

use super::notation::NotationVerifier;
use super::{
    ImageSignatureValidator, ImageVerifier, JsonPatchWebhookMutator, Mutator, OpaJsonPatchMutator,
    OpaValidator, Validator, WebhookValidator,
};
use crate::config::{Config, ConfigError, NotationConfig, WebhookConfig};

fn webhook_section<'a>(
    stage: &str,
    type_name: &str,
    webhook: Option<&'a WebhookConfig>,
) -> Result<&'a WebhookConfig, ConfigError> {
    webhook.ok_or_else(|| ConfigError::MissingStageSection {
        stage: stage.to_string(),
        type_name: type_name.to_string(),
        section: "webhook",
    })
}

fn build_verifier(
    notation: Option<&NotationConfig>,
) -> Result<Option<Arc<dyn ImageVerifier>>, ConfigError> {
    notation
        .map(|cfg| NotationVerifier::from_config(cfg).map(|v| Arc::new(v) as Arc<dyn ImageVerifier>))
        .transpose()
}

/// Build the configured mutators, in configuration order.
pub fn build_mutators(config: &Config) -> Result<(Vec<Arc<dyn Mutator>>, bool), ConfigError> {
    let mut mutators: Vec<Arc<dyn Mutator>> = Vec::new();
    let mut resolve_token = false;

    for entry in &config.mutators {
        resolve_token |= entry.resolve_token;

        let mutator: Arc<dyn Mutator> = match entry.type_name.as_str() {
            "opa_json_patch" => {
                let rule = entry.opa_rule.as_ref().ok_or_else(|| {
                    ConfigError::MissingStageSection {
                        stage: entry.name.clone(),
                        type_name: entry.type_name.clone(),
                        section: "opa_rule",
                    }
                })?;
                let verifier = build_verifier(rule.notation.as_ref())?;
                Arc::new(OpaJsonPatchMutator::new(
                    &entry.name,
                    &rule.filename,
                    &rule.query,
                    verifier,
                )?)
            }
            "json_patch_webhook" => {
                let webhook =
                    webhook_section(&entry.name, &entry.type_name, entry.webhook.as_ref())?;
                Arc::new(JsonPatchWebhookMutator::new(
                    &entry.name,
                    &webhook.endpoint,
                    &webhook.method,
                )?)
            }
            other => {
                return Err(ConfigError::UnknownStageType {
                    kind: "mutator",
                    type_name: other.to_string(),
                    stage: entry.name.clone(),
                })
            }
        };

        info!(stage = %entry.name, kind = %entry.type_name, "registered mutator");
        mutators.push(mutator);
    }

    Ok((mutators, resolve_token))
}

/// Build the configured validators, in configuration order.
pub fn build_validators(config: &Config) -> Result<(Vec<Arc<dyn Validator>>, bool), ConfigError> {
    let mut validators: Vec<Arc<dyn Validator>> = Vec::new();
    let mut resolve_token = false;

    for entry in &config.validators {
        resolve_token |= entry.resolve_token;

        let validator: Arc<dyn Validator> = match entry.type_name.as_str() {
            "opa" => {
                let rule = entry.opa_rule.as_ref().ok_or_else(|| {
                    ConfigError::MissingStageSection {
                        stage: entry.name.clone(),
                        type_name: entry.type_name.clone(),
                        section: "opa_rule",
                    }
                })?;
                let verifier = build_verifier(rule.notation.as_ref())?;
                Arc::new(OpaValidator::new(
                    &entry.name,
                    &rule.filename,
                    &rule.query,
                    verifier,
                )?)
            }
            "webhook" => {
                let webhook =
                    webhook_section(&entry.name, &entry.type_name, entry.webhook.as_ref())?;
                Arc::new(WebhookValidator::new(
                    &entry.name,
                    &webhook.endpoint,
                    &webhook.method,
                )?)
            }
            "notation" => {
                let notation = entry.notation.as_ref().ok_or_else(|| {
                    ConfigError::MissingStageSection {
                        stage: entry.name.clone(),
                        type_name: entry.type_name.clone(),
                        section: "notation",
                    }
                })?;
                let verifier = NotationVerifier::from_config(notation)?;
                Arc::new(ImageSignatureValidator::new(&entry.name, Arc::new(verifier)))
            }
            other => {
                return Err(ConfigError::UnknownStageType {
                    kind: "validator",
                    type_name: other.to_string(),
                    stage: entry.name.clone(),
                })
            }
        };

        info!(stage = %entry.name, kind = %entry.type_name, "registered validator");
        validators.push(validator);
    }

    Ok((validators, resolve_token))
}
