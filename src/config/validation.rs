//! Configuration validation system.

use std::collections::HashMap;
use std::net::SocketAddr;

use super::types::{LogOutput, SpfConfig};
use crate::forward::{validate_endpoint, Protocol};

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation issues.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only errors (not warnings).
    #[must_use]
    pub fn errors_only(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Error)
            .collect()
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &SpfConfig) -> ValidationResult;
}

/// Checks rule endpoints, engine settings and logging output.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &SpfConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.logging.output == LogOutput::File && config.logging.file_path.is_none() {
            result.add_error(ValidationError::error(
                "logging.file_path",
                "File path is required when output is 'file'",
            ));
        }

        if let Err(e) = config.engine.validate() {
            result.add_error(ValidationError::error("engine", e.to_string()));
        }

        for (name, rule) in &config.rules {
            if name.trim().is_empty() {
                result.add_error(ValidationError::error("rules", "Rule name cannot be empty"));
            }
            if let Err(e) = validate_endpoint("listen", &rule.listen, true) {
                result.add_error(ValidationError::error(
                    format!("rules.{name}.listen"),
                    e.to_string(),
                ));
            }
            if let Err(e) = validate_endpoint("target", &rule.target, false) {
                result.add_error(ValidationError::error(
                    format!("rules.{name}.target"),
                    e.to_string(),
                ));
            }
        }

        if config.enabled_rules().next().is_none() {
            result.add_error(ValidationError::warning("rules", "No enabled forwarding rules"));
        }

        result
    }
}

/// Rejects enabled rules of the same protocol sharing a fixed listen address.
#[derive(Debug, Default)]
pub struct ListenConflictValidator;

impl ListenConflictValidator {
    /// Create a new listen conflict validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for ListenConflictValidator {
    fn validate(&self, config: &SpfConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut used: HashMap<(Protocol, String), &str> = HashMap::new();

        for (name, rule) in config.enabled_rules() {
            // Ephemeral listens never collide.
            let key = match rule.listen.parse::<SocketAddr>() {
                Ok(addr) if addr.port() == 0 => continue,
                Ok(addr) => addr.to_string(),
                Err(_) if rule.listen.ends_with(":0") => continue,
                Err(_) => rule.listen.to_ascii_lowercase(),
            };

            if let Some(existing) = used.get(&(rule.protocol, key.clone())) {
                result.add_error(ValidationError::error(
                    format!("rules.{name}.listen"),
                    format!(
                        "{} listen address {} conflicts with rule '{existing}'",
                        rule.protocol, rule.listen
                    ),
                ));
            } else {
                used.insert((rule.protocol, key), name);
            }
        }

        result
    }
}
