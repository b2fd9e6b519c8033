use bigsegments::store::StoreConfig;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("environment name cannot be empty")]
    EmptyEnvironmentName,

    #[error("duplicate environment name: {0}")]
    DuplicateEnvironment(String),

    #[error("environment {0} has an empty SDK key")]
    EmptySdkKey(String),

    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

/// Relay process configuration, loaded from a YAML file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Base URI of the flag-delivery polling service.
    pub base_uri: String,
    /// Base URI of the flag-delivery streaming service.
    pub stream_uri: String,
    /// Enables payload-level TRACE logging in the synchronizers.
    #[serde(default)]
    pub trace_logging: bool,
    pub environments: Vec<EnvironmentConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub name: String,
    pub sdk_key: String,
    /// Big segment store backend; omit to disable big segments for this
    /// environment.
    #[serde(default)]
    pub big_segments: Option<StoreConfig>,
}

impl Config {
    /// Validates the relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        for uri in [&self.base_uri, &self.stream_uri] {
            Url::parse(uri).map_err(|err| ValidationError::InvalidUri(format!("{uri}: {err}")))?;
        }

        let mut names = HashSet::new();
        for environment in &self.environments {
            if environment.name.is_empty() {
                return Err(ValidationError::EmptyEnvironmentName);
            }
            if !names.insert(&environment.name) {
                return Err(ValidationError::DuplicateEnvironment(
                    environment.name.clone(),
                ));
            }
            if environment.sdk_key.is_empty() {
                return Err(ValidationError::EmptySdkKey(environment.name.clone()));
            }
        }

        Ok(())
    }
}
