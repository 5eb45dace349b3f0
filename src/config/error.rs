//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the configuration, or while
/// constructing the stages it describes. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Stage `type` not recognized.
    #[error("unknown {kind} type '{type_name}' for stage '{stage}'")]
    UnknownStageType {
        kind: &'static str,
        type_name: String,
        stage: String,
    },

    /// A stage is missing the sub-section its type requires.
    #[error("stage '{stage}' of type '{type_name}' requires a '{section}' section")]
    MissingStageSection {
        stage: String,
        type_name: String,
        section: &'static str,
    },

    /// A URL in the configuration does not parse.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Webhook stage construction failed.
    #[error("webhook stage: {reason}")]
    Webhook { reason: String },

    /// A policy rule file could not be loaded or compiled.
    #[error("policy rule for stage '{stage}': {reason}")]
    Rule { stage: String, reason: String },

    /// Notation trust material is missing or malformed.
    #[error("notation verifier: {reason}")]
    Notation { reason: String },

    /// TLS material could not be assembled.
    #[error("tls: {reason}")]
    Tls { reason: String },

    /// YAML parsing error.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_saphyr::Error),

    /// I/O error reading the config file or referenced material.
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
