//! The subset of Nomad's HTTP API schema the proxy touches.
//!
//! Only the fields the admission pipeline reads or rewrites are typed; every
//! other field is captured in a flattened map so request and response bodies
//! round-trip without loss. Field names follow Nomad's JSON casing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A Nomad job specification.
///
/// The pipeline treats the job as an opaque document with a stable `ID` and
/// a mutable `Meta` mapping; everything else is carried through untouched in
/// `rest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, String>>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Job {
    /// The job ID, or `""` when absent. Used for log fields.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Collect every container image referenced by the job's tasks.
    ///
    /// Walks `TaskGroups[].Tasks[].Config.image`; tasks whose driver config
    /// has no image entry are skipped.
    pub fn task_images(&self) -> Vec<String> {
        let mut images = Vec::new();
        let Some(groups) = self.rest.get("TaskGroups").and_then(Value::as_array) else {
            return images;
        };
        for group in groups {
            let Some(tasks) = group.get("Tasks").and_then(Value::as_array) else {
                continue;
            };
            for task in tasks {
                if let Some(image) = task
                    .get("Config")
                    .and_then(|c| c.get("image"))
                    .and_then(Value::as_str)
                {
                    images.push(image.to_string());
                }
            }
        }
        images
    }
}

/// Request envelope for `PUT /v1/jobs` and `PUT /v1/job/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRegisterRequest {
    #[serde(rename = "Job")]
    pub job: Option<Job>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Request envelope for `PUT /v1/job/{id}/plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlanRequest {
    #[serde(rename = "Job")]
    pub job: Option<Job>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Request envelope for `PUT /v1/validate/job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobValidateRequest {
    #[serde(rename = "Job")]
    pub job: Option<Job>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Response envelope for job registration. Only `Warnings` is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRegisterResponse {
    #[serde(rename = "Warnings", default)]
    pub warnings: String,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Response envelope for job planning. Only `Warnings` is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlanResponse {
    #[serde(rename = "Warnings", default)]
    pub warnings: String,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Response envelope for job validation.
///
/// `ValidationErrors` and `Error` carry validator rejections in-band;
/// `Warnings` is merged like the other two envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobValidateResponse {
    #[serde(rename = "ValidationErrors", default)]
    pub validation_errors: Vec<String>,

    #[serde(rename = "Error", default)]
    pub error: String,

    #[serde(rename = "Warnings", default)]
    pub warnings: String,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// ACL token descriptor returned by `GET /v1/acl/token/self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclToken {
    #[serde(rename = "AccessorID", default)]
    pub accessor_id: String,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "ID": "app",
            "Name": "app",
            "Meta": {"team": "platform"},
            "Datacenters": ["dc1"],
            "TaskGroups": [{"Name": "web", "Count": 3}],
        });

        let job: Job = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(job.id.as_deref(), Some("app"));
        assert_eq!(
            job.meta.as_ref().and_then(|m| m.get("team")).map(String::as_str),
            Some("platform")
        );

        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_job_without_meta_serializes_without_meta_key() {
        let job: Job = serde_json::from_value(json!({"ID": "app"})).unwrap();
        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back, json!({"ID": "app"}));
    }

    #[test]
    fn test_task_images_walks_all_groups() {
        let job: Job = serde_json::from_value(json!({
            "ID": "app",
            "TaskGroups": [
                {
                    "Name": "web",
                    "Tasks": [
                        {"Name": "nginx", "Config": {"image": "registry.example.com/nginx:1.25"}},
                        {"Name": "sidecar", "Config": {"command": "/bin/sidecar"}},
                    ]
                },
                {
                    "Name": "worker",
                    "Tasks": [
                        {"Name": "worker", "Config": {"image": "registry.example.com/worker:2"}},
                    ]
                }
            ]
        }))
        .unwrap();

        assert_eq!(
            job.task_images(),
            vec![
                "registry.example.com/nginx:1.25".to_string(),
                "registry.example.com/worker:2".to_string(),
            ]
        );
    }

    #[test]
    fn test_task_images_empty_without_task_groups() {
        let job: Job = serde_json::from_value(json!({"ID": "app"})).unwrap();
        assert!(job.task_images().is_empty());
    }

    #[test]
    fn test_register_request_envelope_round_trip() {
        let raw = json!({
            "Job": {"ID": "app"},
            "EnforceIndex": true,
            "JobModifyIndex": 42,
        });
        let req: JobRegisterRequest = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(req.job.as_ref().unwrap().id.as_deref(), Some("app"));
        assert_eq!(serde_json::to_value(&req).unwrap(), raw);
    }

    #[test]
    fn test_validate_response_defaults() {
        let resp: JobValidateResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.validation_errors.is_empty());
        assert!(resp.error.is_empty());
        assert!(resp.warnings.is_empty());
    }

    #[test]
    fn test_acl_token_decodes_accessor() {
        let token: AclToken = serde_json::from_value(json!({
            "AccessorID": "b780e702-98ce-521f-2e5f-c6b87de05b24",
            "Name": "Bootstrap Token",
            "Type": "management",
        }))
        .unwrap();
        assert_eq!(token.accessor_id, "b780e702-98ce-521f-2e5f-c6b87de05b24");
        assert_eq!(
            token.rest.get("Type").and_then(Value::as_str),
            Some("management")
        );
    }
}
