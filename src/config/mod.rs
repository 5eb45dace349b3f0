//! Configuration: YAML schema, loading and validation.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{load_config, validate};
pub use schema::{
    Config, MutatorConfig, NomadConfig, NomadTlsConfig, NotationConfig, OpaRuleConfig, TlsConfig,
    ValidatorConfig, WebhookConfig,
};
