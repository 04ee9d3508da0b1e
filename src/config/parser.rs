//! Description parser for loading stack files.
//!
//! This module handles loading descriptions from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::Description;

/// Environment variable holding the provider API token.
pub const PROVIDER_TOKEN_VAR: &str = "CONVERGE_PROVIDER_TOKEN";

/// Parser for loading stack descriptions.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new description parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a description from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Description> {
        let path = path.as_ref();
        info!("Loading stack description from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a description from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Description> {
        debug!("Parsing YAML stack description");

        let description: Description = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            description.stack.name,
            description.resources.len()
        );
        Ok(description)
    }

    /// Loads a description with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_STACK_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Description> {
        let mut description = self.load_file(path)?;
        Self::apply_env_overrides(&mut description);
        Ok(description)
    }

    /// Applies environment variable overrides to the description.
    fn apply_env_overrides(description: &mut Description) {
        if let Ok(name) = std::env::var("CONVERGE_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            description.stack.name = name;
        }

        if let Ok(env) = std::env::var("CONVERGE_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            description.stack.environment = env;
        }

        if let Ok(bucket) = std::env::var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            description.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            description.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("CONVERGE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            description.provider.endpoint = Some(endpoint);
        }

        if let Ok(raw) = std::env::var("CONVERGE_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(concurrency) => {
                    debug!("Overriding execution.concurrency from environment");
                    description.execution.concurrency = concurrency;
                }
                Err(_) => warn!("Ignoring non-numeric CONVERGE_CONCURRENCY={raw}"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider API token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn get_provider_token() -> Result<String> {
        std::env::var(PROVIDER_TOKEN_VAR).map_err(|_| {
            ConvergeError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_VAR),
            })
        })
    }
}

/// Default description file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "converge.stack.yaml",
    "converge.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the description file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no description file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{AttrExpr, FailureMode, StateBackend};

    #[test]
    fn test_parse_minimal_description() {
        let yaml = r"
stack:
  name: tutorial
";
        let parser = ConfigParser::new();
        let description = parser.parse_yaml(yaml, None).expect("parse");

        assert_eq!(description.stack.name, "tutorial");
        assert_eq!(description.stack.environment, "dev");
        assert_eq!(description.state.backend, StateBackend::Local);
        assert_eq!(description.execution.concurrency, 4);
        assert_eq!(description.execution.on_failure, FailureMode::Abort);
        assert!(description.resources.is_empty());
    }

    #[test]
    fn test_parse_full_description() {
        let yaml = r#"
stack:
  name: tutorial
  environment: prod

state:
  backend: s3
  bucket: converge-state
  prefix: tutorial/prod

provider:
  endpoint: https://cloud.example.com/v1
  timeout_secs: 10

execution:
  concurrency: 8
  on_failure: best_effort
  max_retries: 5

resources:
  - name: main
    kind: aws_vpc
    attributes:
      cidr_block: "10.0.0.0/16"
      enable_dns_hostnames: true
  - name: public
    kind: aws_subnet
    lifecycle:
      create_before_destroy: true
    attributes:
      vpc_id: { ref: aws_vpc.main.id }
      cidr_block: "10.0.1.0/24"
      availability_zone: us-east-1a
  - name: web
    kind: aws_instance
    depends_on: [aws_subnet.public]
    attributes:
      ami: ami-0abcdef
      instance_type: t3.micro
"#;
        let parser = ConfigParser::new();
        let description = parser.parse_yaml(yaml, None).expect("parse");

        assert_eq!(description.state.bucket.as_deref(), Some("converge-state"));
        assert_eq!(description.execution.concurrency, 8);
        assert_eq!(description.execution.on_failure, FailureMode::BestEffort);
        assert_eq!(description.execution.max_retries, 5);
        assert_eq!(description.resources.len(), 3);

        let subnet = &description.resources[1];
        assert!(subnet.lifecycle.create_before_destroy);
        assert_eq!(
            subnet.attributes["vpc_id"],
            AttrExpr::reference("aws_vpc.main.id")
        );
        assert_eq!(description.resources[2].depends_on, vec!["aws_subnet.public"]);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("stack: [unclosed", None);
        assert!(matches!(
            result,
            Err(ConvergeError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(temp.path().join("converge.stack.yaml"), "stack: {name: x}\n")
            .expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("converge.stack.yaml"));
    }
}
