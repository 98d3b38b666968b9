//! Configuration file loader.

use super::error::{ConfigError, ConfigResult};
use super::types::SpfConfig;
use super::validation::{BasicValidator, ListenConflictValidator, ValidationResult, Validator};
use std::path::Path;
use tracing::warn;

/// Configuration loader with validation support.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Validators to run on loaded configuration.
    validators: Vec<Box<dyn Validator>>,
}

impl ConfigLoader {
    /// Create a loader without validators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a loader with the built-in validators.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_validator(BasicValidator::new())
            .with_validator(ListenConflictValidator::new())
    }

    /// Add a validator to the loader.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be read
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<SpfConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<SpfConfig> {
        let config: SpfConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Run every validator, logging warnings and failing on the first errors.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` listing all error messages.
    pub fn validate(&self, config: &SpfConfig) -> ConfigResult<ValidationResult> {
        let mut combined = ValidationResult::new();
        for validator in &self.validators {
            combined.merge(validator.validate(config));
        }

        for warning in combined.warnings() {
            warn!(field = %warning.field, "{}", warning.message);
        }

        if !combined.is_valid() {
            let errors: Vec<String> = combined
                .errors_only()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(ConfigError::ValidationError(errors.join("; ")));
        }
        Ok(combined)
    }
}
