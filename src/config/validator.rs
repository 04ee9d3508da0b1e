//! Description validation.
//!
//! This module checks a parsed description for values that are malformed on
//! their own (names, backend settings, reference syntax) before the graph
//! builder resolves references between resources.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::provider::SchemaCatalog;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    AttrExpr, Description, ExecutionConfig, Reference, ResourceKey, ResourceSpec, StackConfig,
    StateBackend, StateConfig,
};

/// Validator for stack descriptions.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Kinds with a known schema.
    known_kinds: HashSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a validator that knows the built-in schema catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::with_catalog(&SchemaCatalog::builtin())
    }

    /// Creates a validator that knows the kinds of the given catalog.
    #[must_use]
    pub fn with_catalog(catalog: &SchemaCatalog) -> Self {
        Self {
            known_kinds: catalog.kinds().map(str::to_string).collect(),
        }
    }

    /// Validates a stack description.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, description: &Description) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        let mut known = self.known_kinds.clone();
        known.extend(description.schemas.iter().map(|s| s.kind.clone()));

        Self::validate_stack(&description.stack, &mut result);
        Self::validate_state(&description.state, &mut result);
        Self::validate_execution(&description.execution, &mut result);
        Self::validate_resources(&description.resources, &known, &mut result);

        if result.errors.is_empty() {
            debug!("Description validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates stack identity.
    fn validate_stack(stack: &StackConfig, result: &mut ValidationResult) {
        if stack.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("stack.name"),
                message: String::from("Stack name cannot be empty"),
            });
        } else if !is_valid_name(&stack.name) {
            result.errors.push(ValidationError {
                field: String::from("stack.name"),
                message: format!("Stack name '{}' is invalid. {NAME_RULE}", stack.name),
            });
        }

        if stack.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("stack.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates executor tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if execution.max_retries > 10 {
            result.warnings.push(format!(
                "execution.max_retries: {} retries with exponential backoff may take very long",
                execution.max_retries
            ));
        }
    }

    /// Validates all declared resources.
    fn validate_resources(
        resources: &[ResourceSpec],
        known_kinds: &HashSet<String>,
        result: &mut ValidationResult,
    ) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources declared in stack"));
            return;
        }

        let mut seen: HashSet<ResourceKey> = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Resource name '{}' is invalid. {NAME_RULE}", resource.name),
                });
            }

            if !is_valid_name(&resource.kind) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.kind"),
                    message: format!("Resource kind '{}' is invalid", resource.kind),
                });
            } else if !known_kinds.contains(&resource.kind) {
                result.warnings.push(format!(
                    "{prefix}.kind: No schema for '{}'; \
                     every attribute change will force replacement",
                    resource.kind
                ));
            }

            if !seen.insert(resource.key()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource: {}", resource.key()),
                });
            }

            if resource.attributes.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}: Resource {} declares no attributes", resource.key()));
            }

            for (attr, expr) in &resource.attributes {
                Self::validate_expr(expr, &format!("{prefix}.attributes.{attr}"), result);
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                if let Err(message) = ResourceKey::parse(dep) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.depends_on[{j}]"),
                        message,
                    });
                }
            }
        }
    }

    /// Validates reference syntax inside an attribute expression.
    fn validate_expr(expr: &AttrExpr, field: &str, result: &mut ValidationResult) {
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        for text in refs {
            if let Err(message) = Reference::parse(text) {
                result.errors.push(ValidationError {
                    field: field.to_string(),
                    message,
                });
            }
        }
    }
}

impl ValidationResult {
    /// Returns true if there are no errors.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks if a name is valid (lowercase alphanumeric, hyphens, underscores).
const NAME_RULE: &str = "Must be lowercase alphanumeric with hyphens or underscores.";

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.starts_with(['-', '_'])
        && !name.ends_with(['-', '_'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> Description {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("main"));
        assert!(is_valid_name("aws_vpc"));
        assert!(is_valid_name("db-subnet-1"));
        assert!(!is_valid_name("Main"));
        assert!(!is_valid_name("_main"));
        assert!(!is_valid_name("main-"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let description = parse(
            r"
stack: { name: tutorial }
resources:
  - { name: main, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
  - { name: main, kind: aws_vpc, attributes: { cidr_block: 10.1.0.0/16 } }
",
        );
        let result = ConfigValidator::new().validate(&description);
        assert!(result.is_err());
    }

    #[test]
    fn test_same_name_different_kind_allowed() {
        let description = parse(
            r"
stack: { name: tutorial }
resources:
  - { name: main, kind: aws_vpc, attributes: { cidr_block: 10.0.0.0/16 } }
  - { name: main, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc.main } } }
",
        );
        let result = ConfigValidator::new().validate(&description).expect("valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let description = parse(
            r"
stack: { name: tutorial }
resources:
  - { name: public, kind: aws_subnet, attributes: { vpc_id: { ref: aws_vpc } } }
",
        );
        assert!(ConfigValidator::new().validate(&description).is_err());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let description = parse(
            r"
stack: { name: tutorial }
state: { backend: s3 }
",
        );
        assert!(ConfigValidator::new().validate(&description).is_err());
    }

    #[test]
    fn test_unknown_kind_warns() {
        let description = parse(
            r"
stack: { name: tutorial }
resources:
  - { name: thing, kind: custom_widget, attributes: { size: 3 } }
",
        );
        let result = ConfigValidator::new().validate(&description).expect("valid");
        assert!(result.warnings.iter().any(|w| w.contains("custom_widget")));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let description = parse(
            r"
stack: { name: tutorial }
execution: { concurrency: 0 }
",
        );
        assert!(ConfigValidator::new().validate(&description).is_err());
    }
}
