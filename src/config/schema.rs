//! Configuration schema.
//!
//! The file is YAML; field names are snake_case. Every option is shown in
//! the sample below; only `nomad.address` deviates from its default in a
//! minimal deployment.
//!
//! ```yaml
//! bind: 0.0.0.0
//! port: 6464
//! log_level: info
//!
//! tls:
//!   cert_file: /etc/jobgate/server.pem
//!   key_file: /etc/jobgate/server-key.pem
//!   ca_file: /etc/jobgate/ca.pem
//!   no_client_cert: false
//!
//! nomad:
//!   address: https://nomad.service.consul:4646
//!   tls:
//!     cert_file: /etc/jobgate/client.pem
//!     key_file: /etc/jobgate/client-key.pem
//!     ca_file: /etc/jobgate/nomad-ca.pem
//!     insecure_skip_verify: false
//!
//! mutators:
//!   - name: set-costcenter
//!     type: opa_json_patch
//!     opa_rule:
//!       filename: costcenter.rego
//!       query: data.costcenter.result
//!
//! validators:
//!   - name: deny-privileged
//!     type: webhook
//!     resolve_token: true
//!     webhook:
//!       endpoint: https://hooks.internal/deny-privileged
//!       method: POST
//! ```

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// TLS termination on the listener. Absent means plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub nomad: NomadConfig,

    #[serde(default)]
    pub mutators: Vec<MutatorConfig>,

    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
}

impl Config {
    /// The configuration used when no config file is given: a plain HTTP
    /// listener in front of a local Nomad agent, with no stages.
    pub fn default_config() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            log_level: default_log_level(),
            ..Self::default()
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6464
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_nomad_address() -> String {
    "http://localhost:4646".to_string()
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

fn default_max_sig_attempts() -> usize {
    50
}

/// Listener TLS material.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,

    /// CA bundle for verifying client certificates. When set, clients must
    /// present a certificate unless `no_client_cert` is also set.
    #[serde(default)]
    pub ca_file: Option<String>,

    #[serde(default)]
    pub no_client_cert: bool,
}

/// The upstream Nomad agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NomadConfig {
    #[serde(default = "default_nomad_address")]
    pub address: String,

    #[serde(default)]
    pub tls: Option<NomadTlsConfig>,
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: default_nomad_address(),
            tls: None,
        }
    }
}

/// Client TLS used for the upstream connection and token resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NomadTlsConfig {
    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    #[serde(default)]
    pub ca_file: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// One configured mutator stage.
///
/// `type` selects the transport: `opa_json_patch` (local policy rule
/// producing a JSON-Patch) or `json_patch_webhook` (external HTTP hook).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutatorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    /// Resolve the caller's ACL token against Nomad before this stage runs.
    #[serde(default)]
    pub resolve_token: bool,

    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    #[serde(default)]
    pub opa_rule: Option<OpaRuleConfig>,
}

/// One configured validator stage.
///
/// `type` selects the transport: `opa` (local policy rule), `webhook`
/// (external HTTP hook) or `notation` (image signature verification).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub resolve_token: bool,

    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    #[serde(default)]
    pub opa_rule: Option<OpaRuleConfig>,

    #[serde(default)]
    pub notation: Option<NotationConfig>,
}

/// Endpoint of a webhook stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub endpoint: String,

    #[serde(default = "default_webhook_method")]
    pub method: String,
}

/// A local policy rule file and the query to evaluate against it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpaRuleConfig {
    pub filename: String,
    pub query: String,

    /// Attach image signature verification to this rule's stage.
    #[serde(default)]
    pub notation: Option<NotationConfig>,
}

/// Trust material for image signature verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotationConfig {
    pub trust_policy_file: String,
    pub trust_store_dir: String,

    /// Talk to the registry over plain HTTP (development registries).
    #[serde(default)]
    pub repo_plain_http: bool,

    /// Upper bound on signatures examined per image.
    #[serde(default = "default_max_sig_attempts")]
    pub max_sig_attempts: usize,

    /// Docker-style credential store for registry authentication.
    #[serde(default)]
    pub credential_store_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default_config();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 6464);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.nomad.address, "http://localhost:4646");
        assert!(config.tls.is_none());
        assert!(config.mutators.is_empty());
        assert!(config.validators.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
bind: 127.0.0.1
port: 8443
log_level: debug

tls:
  cert_file: server.pem
  key_file: server-key.pem
  ca_file: ca.pem
  no_client_cert: true

nomad:
  address: https://nomad.example.com:4646
  tls:
    ca_file: nomad-ca.pem
    insecure_skip_verify: false

mutators:
  - name: hello
    type: json_patch_webhook
    webhook:
      endpoint: http://hooks.internal/hello
      method: POST
  - name: costcenter
    type: opa_json_patch
    resolve_token: true
    opa_rule:
      filename: costcenter.rego
      query: data.costcenter.result

validators:
  - name: deny-privileged
    type: opa
    opa_rule:
      filename: privileged.rego
      query: data.privileged.result
  - name: signed-images
    type: notation
    notation:
      trust_policy_file: trustpolicy.json
      trust_store_dir: truststore
      repo_plain_http: true
      max_sig_attempts: 10
"#;
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.port, 8443);
        assert!(config.tls.as_ref().unwrap().no_client_cert);
        assert_eq!(config.mutators.len(), 2);
        assert_eq!(config.mutators[1].type_name, "opa_json_patch");
        assert!(config.mutators[1].resolve_token);
        assert_eq!(config.validators.len(), 2);
        let notation = config.validators[1].notation.as_ref().unwrap();
        assert_eq!(notation.max_sig_attempts, 10);
        assert!(notation.repo_plain_http);
    }

    #[test]
    fn test_webhook_method_defaults_to_post() {
        let yaml = r#"
mutators:
  - name: hello
    type: json_patch_webhook
    webhook:
      endpoint: http://hooks.internal/hello
"#;
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.mutators[0].webhook.as_ref().unwrap().method, "POST");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let yaml = "bind: 0.0.0.0\nbanana: true\n";
        assert!(serde_saphyr::from_str::<Config>(yaml).is_err());
    }
}
