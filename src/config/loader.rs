//! Configuration loading and validation.

use std::path::Path;

use url::Url;

use super::error::ConfigError;
use super::schema::Config;

/// Load a configuration file. Parse failures and unreadable files are fatal.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = serde_saphyr::from_str(&contents)?;
    validate(&config)?;
    Ok(config)
}

/// Structural validation beyond what deserialization enforces.
///
/// Stage `type` values are checked here so a typo fails startup instead of
/// silently skipping a controller; the stage factories repeat the check when
/// they construct the actual instances.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    Url::parse(&config.nomad.address).map_err(|e| ConfigError::InvalidUrl {
        url: config.nomad.address.clone(),
        reason: format!("nomad.address: {e}"),
    })?;

    for mutator in &config.mutators {
        match mutator.type_name.as_str() {
            "opa_json_patch" | "json_patch_webhook" => {}
            other => {
                return Err(ConfigError::UnknownStageType {
                    kind: "mutator",
                    type_name: other.to_string(),
                    stage: mutator.name.clone(),
                })
            }
        }
    }

    for validator in &config.validators {
        match validator.type_name.as_str() {
            "opa" | "webhook" | "notation" => {}
            other => {
                return Err(ConfigError::UnknownStageType {
                    kind: "validator",
                    type_name: other.to_string(),
                    stage: validator.name.clone(),
                })
            }
        }
    }

    Ok(())
}
