//! Service configuration.
//!
//! Configuration is assembled exactly once, in the server binary's startup
//! path, and passed into the router state; no pipeline component reads
//! ambient environment state. Operational knobs come from an optional TOML
//! file with serde defaults; the provider credential comes from the
//! environment and is held as a [`SecretString`] so it never appears in
//! debug output or logs.

use std::path::Path;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imaging::ImagingConfig;
use crate::inference::{InferenceConfig, RetryPolicy};
use crate::policy::PolicyConfig;
use crate::usage::UsageConfig;

/// Environment variables checked, in order, for the provider credential.
pub const CREDENTIAL_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level service configuration.
///
/// Every field has a serde default, so an empty file (or no file) yields
/// the stock configuration. The credential is deliberately not part of the
/// file schema; see [`ServiceConfig::credential_from_env`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Rate limiting knobs.
    pub usage: UsageConfig,

    /// Image normalization knobs.
    pub imaging: ImagingConfig,

    /// Inference provider endpoint and timeouts.
    pub inference: InferenceConfig,

    /// Transport retry policy for the inference call.
    pub retry: RetryPolicy,

    /// Forbidden-term policy.
    pub policy: PolicyConfig,
}

impl ServiceConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid for this schema.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads the provider credential from the environment.
    ///
    /// Returns `None` when no variable is set or the value is blank. A
    /// missing credential is surfaced as a request-time configuration
    /// fault, never silently bypassed.
    #[must_use]
    pub fn credential_from_env() -> Option<SecretString> {
        for var in CREDENTIAL_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    return Some(SecretString::from(value));
                }
            }
        }
        None
    }
}
