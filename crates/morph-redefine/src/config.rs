//! Redefinition configuration and agent environments
//!
//! Configuration is read from TOML:
//!
//! ```toml
//! [capabilities]
//! can_redefine_classes = true
//! can_structurally_redefine_classes = true
//!
//! [checks]
//! verify_members_matched_once = true
//! collect_before_instance_scan = true
//!
//! [classes]
//! never_obsolete = ["Lmorph/internal/Redefiner;"]
//! ```
//!
//! Every table and key is optional.

use crate::error::{ErrorCode, RedefineError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Capabilities an agent environment may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Allows in-place redefinition
    pub can_redefine_classes: bool,
    /// Allows structural redefinition
    pub can_structurally_redefine_classes: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_redefine_classes: true,
            can_structurally_redefine_classes: false,
        }
    }
}

/// Optional consistency checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checks {
    /// Check that every existing member is matched exactly once
    pub verify_members_matched_once: bool,
    /// Collect garbage right before scanning for instances to migrate
    pub collect_before_instance_scan: bool,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            verify_members_matched_once: cfg!(debug_assertions),
            collect_before_instance_scan: true,
        }
    }
}

/// Per-class policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassPolicy {
    /// Descriptors of classes whose frames can never be made obsolete
    pub never_obsolete: Vec<String>,
}

/// Redefinition configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedefinitionConfig {
    /// Capabilities granted to environments built from this configuration
    pub capabilities: Capabilities,
    /// Consistency checks
    pub checks: Checks,
    /// Class policy
    pub classes: ClassPolicy,
}

impl RedefinitionConfig {
    /// Load a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: RedefinitionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for descriptor in &self.classes.never_obsolete {
            if !morph_classfile::descriptor::is_class_descriptor(descriptor) {
                return Err(ConfigError::ValidationError(format!(
                    "never_obsolete entry '{descriptor}' is not a class descriptor"
                )));
            }
        }
        Ok(())
    }

    /// Whether frames of `descriptor` can never be made obsolete
    pub fn is_never_obsolete(&self, descriptor: &str) -> bool {
        self.classes.never_obsolete.iter().any(|d| d == descriptor)
    }
}

/// A client environment holding capabilities
///
/// Requests made through a disposed environment fail with
/// [`ErrorCode::InvalidEnvironment`].
#[derive(Debug)]
pub struct AgentEnv {
    capabilities: RwLock<Capabilities>,
    config: RedefinitionConfig,
    disposed: AtomicBool,
}

impl AgentEnv {
    /// Create an environment with the configuration's capabilities
    pub fn new(config: RedefinitionConfig) -> Self {
        Self {
            capabilities: RwLock::new(config.capabilities),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    /// Current capabilities
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.read()
    }

    /// Replace the held capabilities
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.write() = capabilities;
    }

    /// Configuration
    pub fn config(&self) -> &RedefinitionConfig {
        &self.config
    }

    /// Dispose the environment
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Whether the environment was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fail if the environment was disposed
    pub(crate) fn ensure_valid(&self) -> Result<(), RedefineError> {
        if self.is_disposed() {
            return Err(RedefineError::new(
                ErrorCode::InvalidEnvironment,
                "environment has been disposed",
            ));
        }
        Ok(())
    }
}

impl Default for AgentEnv {
    fn default() -> Self {
        Self::new(RedefinitionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let config = RedefinitionConfig::from_str(
            r#"
[capabilities]
can_redefine_classes = true
can_structurally_redefine_classes = true

[checks]
verify_members_matched_once = true
collect_before_instance_scan = false

[classes]
never_obsolete = ["Lmorph/internal/Redefiner;"]
"#,
        )
        .unwrap();
        assert!(config.capabilities.can_structurally_redefine_classes);
        assert!(config.checks.verify_members_matched_once);
        assert!(!config.checks.collect_before_instance_scan);
        assert!(config.is_never_obsolete("Lmorph/internal/Redefiner;"));
        assert!(!config.is_never_obsolete("LOther;"));
    }

    #[test]
    fn test_defaults() {
        let config = RedefinitionConfig::from_str("").unwrap();
        assert_eq!(config, RedefinitionConfig::default());
        assert!(config.capabilities.can_redefine_classes);
        assert!(!config.capabilities.can_structurally_redefine_classes);
        assert!(config.checks.collect_before_instance_scan);
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let err = RedefinitionConfig::from_str("[classes]\nnever_obsolete = [\"I\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = RedefinitionConfig::from_str("[capabilities\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capabilities]\ncan_structurally_redefine_classes = true").unwrap();
        let config = RedefinitionConfig::from_file(file.path()).unwrap();
        assert!(config.capabilities.can_structurally_redefine_classes);

        let missing = RedefinitionConfig::from_file(Path::new("/nonexistent/morph.toml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_env_dispose() {
        let env = AgentEnv::default();
        assert!(env.ensure_valid().is_ok());
        env.set_capabilities(Capabilities {
            can_redefine_classes: false,
            can_structurally_redefine_classes: false,
        });
        assert!(!env.capabilities().can_redefine_classes);
        env.dispose();
        assert_eq!(env.ensure_valid().unwrap_err().code, ErrorCode::InvalidEnvironment);
    }
}
