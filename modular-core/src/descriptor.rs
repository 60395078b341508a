//! Module descriptor: the small document shipped alongside an installable
//! module. Exactly five fields are honored; anything else in the file is
//! ignored by the loader.

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor field {0:?} is empty")]
    EmptyField(&'static str),
    #[error("module name {0:?} contains whitespace or control characters")]
    InvalidModuleName(String),
    #[error("mount point {0:?} must start with '/' and contain no whitespace")]
    InvalidMountPoint(String),
    #[error("dependency on {0:?} references the module itself")]
    SelfDependency(String),
    #[error("dependency {0:?} is listed twice")]
    DuplicateDependency(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub module_name: String,
    pub min_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub module_name: String,
    /// Path (relative to the descriptor) of the command tree document.
    pub cli_path: String,
    pub mount_point: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub version: Version,
}

impl ModuleDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.module_name.is_empty() {
            return Err(DescriptorError::EmptyField("module_name"));
        }
        if self.module_name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DescriptorError::InvalidModuleName(self.module_name.clone()));
        }
        if self.cli_path.is_empty() {
            return Err(DescriptorError::EmptyField("cli_path"));
        }
        if !self.mount_point.starts_with('/')
            || self.mount_point.chars().any(char::is_whitespace)
        {
            return Err(DescriptorError::InvalidMountPoint(self.mount_point.clone()));
        }
        let mut seen: Vec<&str> = Vec::new();
        for dependency in &self.dependencies {
            if dependency.module_name == self.module_name {
                return Err(DescriptorError::SelfDependency(dependency.module_name.clone()));
            }
            if seen.contains(&dependency.module_name.as_str()) {
                return Err(DescriptorError::DuplicateDependency(
                    dependency.module_name.clone(),
                ));
            }
            seen.push(&dependency.module_name);
        }
        Ok(())
    }
}
