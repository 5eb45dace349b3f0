//! The admission pipeline: ordered mutators, then ordered validators.
//!
//! Chain semantics:
//!
//! - Stages run in configuration order; validators only after every mutator.
//! - Each stage sees exactly the job returned by the previous mutator; a
//!   mutator returning no job is a no-op and the previous job flows on.
//! - The first hard error stops the chain. The erroring stage contributes
//!   no warnings; warnings from earlier stages are preserved where the
//!   caller has a response to attach them to.
//! - Warnings are additive and keep insertion order across stages.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{AdmissionError, Mutator, Payload, Validator};
use crate::nomad::Job;

/// A successful pipeline run: the final job plus accumulated warnings.
#[derive(Debug)]
pub struct AdmissionResult {
    pub job: Job,
    pub warnings: Vec<String>,
}

/// The outcome of running validators alone.
///
/// A rejection here is data, not control flow: on the validate route it is
/// merged into the upstream reply while the forward proceeds. Warnings
/// gathered before the rejecting validator are preserved.
#[derive(Debug)]
pub struct ValidatorVerdict {
    pub warnings: Vec<String>,
    pub rejection: Option<AdmissionError>,
}

/// A pre-built pipeline of admission controllers, shared across requests.
pub struct Pipeline {
    mutators: Vec<Arc<dyn Mutator>>,
    validators: Vec<Arc<dyn Validator>>,
    resolve_token: bool,
}

impl Pipeline {
    pub fn new(
        mutators: Vec<Arc<dyn Mutator>>,
        validators: Vec<Arc<dyn Validator>>,
        resolve_token: bool,
    ) -> Self {
        Self {
            mutators,
            validators,
            resolve_token,
        }
    }

    /// Whether any configured stage asked for the caller's token descriptor
    /// to be resolved against Nomad before the pipeline runs.
    pub fn resolve_token(&self) -> bool {
        self.resolve_token
    }

    /// Run mutators then validators. A hard error from either phase stops
    /// the request.
    pub async fn apply_admission_controllers(
        &self,
        payload: Payload,
    ) -> Result<AdmissionResult, AdmissionError> {
        let context = payload.context.clone();
        let AdmissionResult { job, mut warnings } = self.admission_mutators(payload).await?;

        let validated = Payload::new(job, context);
        let verdict = self.admission_validators(&validated).await;
        warnings.extend(verdict.warnings);
        if let Some(rejection) = verdict.rejection {
            return Err(rejection);
        }

        Ok(AdmissionResult {
            job: validated.job,
            warnings,
        })
    }

    /// Run only the mutators, feeding each one the previous stage's job.
    pub async fn admission_mutators(
        &self,
        mut payload: Payload,
    ) -> Result<AdmissionResult, AdmissionError> {
        let mut warnings = Vec::new();

        for mutator in &self.mutators {
            debug!(stage = mutator.name(), job = payload.job.id_str(), "running mutator");
            let mutation = mutator.mutate(&payload).await.inspect_err(|error| {
                warn!(stage = mutator.name(), %error, "mutator failed");
            })?;

            if !mutation.warnings.is_empty() {
                info!(
                    stage = mutator.name(),
                    count = mutation.warnings.len(),
                    "mutator returned warnings"
                );
                warnings.extend(mutation.warnings);
            }
            if let Some(job) = mutation.job {
                payload.job = job;
            }
        }

        Ok(AdmissionResult {
            job: payload.job,
            warnings,
        })
    }

    /// Run only the validators against the (already mutated) job.
    pub async fn admission_validators(&self, payload: &Payload) -> ValidatorVerdict {
        let mut warnings = Vec::new();

        for validator in &self.validators {
            debug!(stage = validator.name(), job = payload.job.id_str(), "running validator");
            match validator.validate(payload).await {
                Ok(stage_warnings) => {
                    if !stage_warnings.is_empty() {
                        info!(
                            stage = validator.name(),
                            count = stage_warnings.len(),
                            "validator returned warnings"
                        );
                        warnings.extend(stage_warnings);
                    }
                }
                Err(error) => {
                    warn!(stage = validator.name(), %error, "validator rejected job");
                    return ValidatorVerdict {
                        warnings,
                        rejection: Some(error),
                    };
                }
            }
        }

        ValidatorVerdict {
            warnings,
            rejection: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Mutation, Mutator, Validator};
    use crate::multierror::MultiError;
    use async_trait::async_trait;
    use serde_json::json;

    fn job(id: &str) -> Job {
        serde_json::from_value(json!({ "ID": id })).unwrap()
    }

    fn payload(id: &str) -> Payload {
        Payload::new(job(id), None)
    }

    /// Mutator that stamps a meta key and optionally warns.
    struct MetaStamp {
        name: &'static str,
        key: &'static str,
        warnings: Vec<String>,
    }

    #[async_trait]
    impl Mutator for MetaStamp {
        fn name(&self) -> &str {
            self.name
        }

        async fn mutate(&self, payload: &Payload) -> Result<Mutation, AdmissionError> {
            let mut job = payload.job.clone();
            job.meta
                .get_or_insert_with(Default::default)
                .insert(self.key.to_string(), "set".to_string());
            Ok(Mutation {
                job: Some(job),
                warnings: self.warnings.clone(),
            })
        }
    }

    /// Mutator that returns no job at all.
    struct NoOpMutator;

    #[async_trait]
    impl Mutator for NoOpMutator {
        fn name(&self) -> &str {
            "noop"
        }

        async fn mutate(&self, _payload: &Payload) -> Result<Mutation, AdmissionError> {
            Ok(Mutation::unchanged())
        }
    }

    struct FailingMutator;

    #[async_trait]
    impl Mutator for FailingMutator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn mutate(&self, _payload: &Payload) -> Result<Mutation, AdmissionError> {
            Err(AdmissionError::Transport {
                stage: "failing".to_string(),
                reason: "boom".to_string(),
            })
        }
    }

    struct WarningValidator(&'static str);

    #[async_trait]
    impl Validator for WarningValidator {
        fn name(&self) -> &str {
            "warner"
        }

        async fn validate(&self, _payload: &Payload) -> Result<Vec<String>, AdmissionError> {
            Ok(vec![self.0.to_string()])
        }
    }

    struct RejectingValidator;

    #[async_trait]
    impl Validator for RejectingValidator {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn validate(&self, _payload: &Payload) -> Result<Vec<String>, AdmissionError> {
            Err(AdmissionError::Rejected {
                stage: "rejecting".to_string(),
                errors: MultiError::new(vec!["bad".to_string()]),
            })
        }
    }

    #[tokio::test]
    async fn test_empty_pipeline_leaves_job_untouched() {
        let pipeline = Pipeline::new(Vec::new(), Vec::new(), false);
        let input = payload("app");
        let original = serde_json::to_value(&input.job).unwrap();

        let result = pipeline.apply_admission_controllers(input).await.unwrap();
        assert_eq!(serde_json::to_value(&result.job).unwrap(), original);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_mutators_run_in_order_and_compose() {
        let pipeline = Pipeline::new(
            vec![
                Arc::new(MetaStamp {
                    name: "first",
                    key: "a",
                    warnings: vec!["w-a".to_string()],
                }),
                Arc::new(MetaStamp {
                    name: "second",
                    key: "b",
                    warnings: vec!["w-b".to_string()],
                }),
            ],
            Vec::new(),
            false,
        );

        let result = pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .unwrap();

        let meta = result.job.meta.unwrap();
        assert!(meta.contains_key("a"));
        assert!(meta.contains_key("b"));
        assert_eq!(result.warnings, vec!["w-a", "w-b"]);
    }

    #[tokio::test]
    async fn test_nil_job_mutation_is_a_no_op() {
        let pipeline = Pipeline::new(
            vec![
                Arc::new(MetaStamp {
                    name: "stamp",
                    key: "a",
                    warnings: Vec::new(),
                }),
                Arc::new(NoOpMutator),
            ],
            Vec::new(),
            false,
        );

        let result = pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .unwrap();
        assert!(result.job.meta.unwrap().contains_key("a"));
    }

    #[tokio::test]
    async fn test_mutator_error_short_circuits() {
        let pipeline = Pipeline::new(
            vec![
                Arc::new(FailingMutator),
                Arc::new(MetaStamp {
                    name: "unreached",
                    key: "x",
                    warnings: Vec::new(),
                }),
            ],
            Vec::new(),
            false,
        );

        let err = pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_validator_warnings_follow_mutator_warnings() {
        let pipeline = Pipeline::new(
            vec![Arc::new(MetaStamp {
                name: "stamp",
                key: "a",
                warnings: vec!["from mutator".to_string()],
            })],
            vec![Arc::new(WarningValidator("from validator"))],
            false,
        );

        let result = pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .unwrap();
        assert_eq!(result.warnings, vec!["from mutator", "from validator"]);
    }

    #[tokio::test]
    async fn test_validator_rejection_fails_apply() {
        let pipeline = Pipeline::new(
            Vec::new(),
            vec![Arc::new(RejectingValidator)],
            false,
        );

        let err = pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_verdict_preserves_warnings_before_rejection() {
        let pipeline = Pipeline::new(
            Vec::new(),
            vec![
                Arc::new(WarningValidator("heads up")),
                Arc::new(RejectingValidator),
                Arc::new(WarningValidator("unreached")),
            ],
            false,
        );

        let verdict = pipeline.admission_validators(&payload("app")).await;
        assert_eq!(verdict.warnings, vec!["heads up"]);
        assert!(verdict.rejection.is_some());
    }

    #[tokio::test]
    async fn test_validators_see_the_mutated_job() {
        struct MetaChecker;

        #[async_trait]
        impl Validator for MetaChecker {
            fn name(&self) -> &str {
                "meta-checker"
            }

            async fn validate(&self, payload: &Payload) -> Result<Vec<String>, AdmissionError> {
                let has_stamp = payload
                    .job
                    .meta
                    .as_ref()
                    .is_some_and(|m| m.contains_key("a"));
                if has_stamp {
                    Ok(Vec::new())
                } else {
                    Err(AdmissionError::Rejected {
                        stage: "meta-checker".to_string(),
                        errors: MultiError::new(vec!["stamp missing".to_string()]),
                    })
                }
            }
        }

        let pipeline = Pipeline::new(
            vec![Arc::new(MetaStamp {
                name: "stamp",
                key: "a",
                warnings: Vec::new(),
            })],
            vec![Arc::new(MetaChecker)],
            false,
        );

        assert!(pipeline
            .apply_admission_controllers(payload("app"))
            .await
            .is_ok());
    }

    #[test]
    fn test_resolve_token_flag() {
        let pipeline = Pipeline::new(Vec::new(), Vec::new(), true);
        assert!(pipeline.resolve_token());
        let pipeline = Pipeline::new(Vec::new(), Vec::new(), false);
        assert!(!pipeline.resolve_token());
    }
}
