//! Policy-engine stages backed by local Rego rules.
//!
//! A rule file is compiled into a `regorus` engine at startup; per request
//! the engine is cloned, fed the payload as `input`, and the configured
//! query evaluated. The query must yield an object shaped like a webhook
//! reply: `{errors, warnings}` for validators, plus `patch` for mutators.
//! The returned lists are treated exactly like their webhook counterparts.
//!
//! A stage may additionally carry an image verifier; after the rule
//! evaluates cleanly, every container image referenced by the job is
//! verified and failures are collected into one hard error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::notation::{verify_job_images, ImageVerifier};
use super::webhook::apply_patch;
use super::{AdmissionError, Mutation, Mutator, Payload, Validator};
use crate::config::ConfigError;
use crate::multierror::MultiError;

/// What a rule query must evaluate to.
#[derive(Debug, Default, Deserialize)]
struct RuleOutcome {
    #[serde(default)]
    patch: Value,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

/// A compiled rule file plus the query to run against it.
struct Rule {
    engine: regorus::Engine,
    query: String,
}

impl Rule {
    fn load(stage: &str, filename: &str, query: &str) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(filename).map_err(|e| ConfigError::Rule {
            stage: stage.to_string(),
            reason: format!("reading {filename}: {e}"),
        })?;

        let mut engine = regorus::Engine::new();
        engine
            .add_policy(filename.to_string(), source)
            .map_err(|e| ConfigError::Rule {
                stage: stage.to_string(),
                reason: format!("compiling {filename}: {e}"),
            })?;

        Ok(Self {
            engine,
            query: query.to_string(),
        })
    }

    /// Evaluate the query for one payload.
    ///
    /// The engine is cloned per evaluation so shared stage instances stay
    /// free of request-scoped state.
    fn evaluate(&self, stage: &str, payload: &Payload) -> Result<RuleOutcome, AdmissionError> {
        let fail = |reason: String| AdmissionError::Evaluation {
            stage: stage.to_string(),
            reason,
        };

        let input = serde_json::to_value(payload).map_err(|e| fail(e.to_string()))?;

        let mut engine = self.engine.clone();
        engine.set_input(input.into());

        let results = engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| fail(e.to_string()))?;

        let value = results
            .result
            .iter()
            .flat_map(|r| r.expressions.iter())
            .map(|e| &e.value)
            .next()
            .ok_or_else(|| fail(format!("query '{}' produced no result", self.query)))?;

        let json = serde_json::to_value(value).map_err(|e| fail(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| {
            fail(format!(
                "query '{}' must yield an object with 'patch'/'errors'/'warnings': {e}",
                self.query
            ))
        })
    }
}

/// Validator evaluating a local Rego rule, optionally followed by image
/// signature verification.
pub struct OpaValidator {
    name: String,
    rule: Rule,
    verifier: Option<Arc<dyn ImageVerifier>>,
}

impl OpaValidator {
    pub fn new(
        name: &str,
        filename: &str,
        query: &str,
        verifier: Option<Arc<dyn ImageVerifier>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.to_string(),
            rule: Rule::load(name, filename, query)?,
            verifier,
        })
    }
}

#[async_trait]
impl Validator for OpaValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, payload: &Payload) -> Result<Vec<String>, AdmissionError> {
        let outcome = self.rule.evaluate(&self.name, payload)?;
        debug!(
            stage = %self.name,
            job = payload.job.id_str(),
            errors = outcome.errors.len(),
            warnings = outcome.warnings.len(),
            "rule evaluated"
        );

        if !outcome.errors.is_empty() {
            return Err(AdmissionError::Rejected {
                stage: self.name.clone(),
                errors: MultiError::new(outcome.errors),
            });
        }

        if let Some(verifier) = &self.verifier {
            verify_job_images(&self.name, verifier.as_ref(), &payload.job).await?;
        }

        Ok(outcome.warnings)
    }
}

/// Mutator evaluating a local Rego rule that produces a JSON-Patch.
pub struct OpaJsonPatchMutator {
    name: String,
    rule: Rule,
    verifier: Option<Arc<dyn ImageVerifier>>,
}

impl OpaJsonPatchMutator {
    pub fn new(
        name: &str,
        filename: &str,
        query: &str,
        verifier: Option<Arc<dyn ImageVerifier>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.to_string(),
            rule: Rule::load(name, filename, query)?,
            verifier,
        })
    }
}

#[async_trait]
impl Mutator for OpaJsonPatchMutator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mutate(&self, payload: &Payload) -> Result<Mutation, AdmissionError> {
        let outcome = self.rule.evaluate(&self.name, payload)?;

        if !outcome.errors.is_empty() {
            return Err(AdmissionError::Rejected {
                stage: self.name.clone(),
                errors: MultiError::new(outcome.errors),
            });
        }

        if let Some(verifier) = &self.verifier {
            verify_job_images(&self.name, verifier.as_ref(), &payload.job).await?;
        }

        let job = apply_patch(&self.name, &payload.job, outcome.patch)?;
        if job.is_some() {
            debug!(stage = %self.name, job = payload.job.id_str(), "applied rule patch");
        }

        Ok(Mutation {
            job,
            warnings: outcome.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nomad::Job;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn rule_file(source: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{source}").unwrap();
        file
    }

    fn payload(job: Value) -> Payload {
        let job: Job = serde_json::from_value(job).unwrap();
        Payload::new(job, None)
    }

    #[test]
    fn test_missing_rule_file_fails_construction() {
        let result = OpaValidator::new("check", "/nonexistent.rego", "data.x.result", None);
        assert!(matches!(result, Err(ConfigError::Rule { .. })));
    }

    #[test]
    fn test_unparseable_rule_fails_construction() {
        let file = rule_file("this is not rego");
        let result = OpaValidator::new(
            "check",
            file.path().to_str().unwrap(),
            "data.x.result",
            None,
        );
        assert!(matches!(result, Err(ConfigError::Rule { .. })));
    }

    #[tokio::test]
    async fn test_validator_surfaces_rule_errors() {
        let file = rule_file(
            r#"package admission

errors := [msg | input.Job.ID == "bad"; msg := "forbidden job id"]

result := {"errors": errors, "warnings": []}
"#,
        );
        let validator = OpaValidator::new(
            "check",
            file.path().to_str().unwrap(),
            "data.admission.result",
            None,
        )
        .unwrap();

        let err = validator
            .validate(&payload(json!({"ID": "bad"})))
            .await
            .unwrap_err();
        match err {
            AdmissionError::Rejected { errors, .. } => {
                assert_eq!(errors.errors(), &["forbidden job id"]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let warnings = validator
            .validate(&payload(json!({"ID": "good"})))
            .await
            .unwrap();
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_validator_surfaces_rule_warnings() {
        let file = rule_file(
            r#"package admission

warnings := [msg | not input.Job.Meta; msg := "job has no meta"]

result := {"errors": [], "warnings": warnings}
"#,
        );
        let validator = OpaValidator::new(
            "check",
            file.path().to_str().unwrap(),
            "data.admission.result",
            None,
        )
        .unwrap();

        let warnings = validator
            .validate(&payload(json!({"ID": "app"})))
            .await
            .unwrap();
        assert_eq!(warnings, vec!["job has no meta"]);
    }

    #[tokio::test]
    async fn test_mutator_applies_rule_patch() {
        let file = rule_file(
            r#"package admission

patch := [op |
    not input.Job.Meta
    op := {"op": "add", "path": "/Meta", "value": {"managed": "true"}}
]

result := {"patch": patch, "errors": [], "warnings": []}
"#,
        );
        let mutator = OpaJsonPatchMutator::new(
            "stamp",
            file.path().to_str().unwrap(),
            "data.admission.result",
            None,
        )
        .unwrap();

        let mutation = mutator.mutate(&payload(json!({"ID": "app"}))).await.unwrap();
        let job = mutation.job.expect("patched job");
        assert_eq!(
            job.meta.unwrap().get("managed").map(String::as_str),
            Some("true")
        );

        // Job that already has Meta produces an empty patch, hence a no-op.
        let mutation = mutator
            .mutate(&payload(json!({"ID": "app", "Meta": {"x": "y"}})))
            .await
            .unwrap();
        assert!(mutation.job.is_none());
    }

    #[tokio::test]
    async fn test_query_with_no_result_is_an_evaluation_error() {
        let file = rule_file("package admission\n\nresult := {\"errors\": []}\n");
        let validator = OpaValidator::new(
            "check",
            file.path().to_str().unwrap(),
            "data.admission.missing",
            None,
        )
        .unwrap();

        let err = validator
            .validate(&payload(json!({"ID": "app"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Evaluation { .. }));
    }

    #[tokio::test]
    async fn test_query_yielding_non_object_is_an_evaluation_error() {
        let file = rule_file("package admission\n\nresult := \"nope\"\n");
        let validator = OpaValidator::new(
            "check",
            file.path().to_str().unwrap(),
            "data.admission.result",
            None,
        )
        .unwrap();

        let err = validator
            .validate(&payload(json!({"ID": "app"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Evaluation { .. }));
    }
}
