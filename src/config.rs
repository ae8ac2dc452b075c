//! Controller-startup configuration document.
//!
//! A thin, non-validating `serde_yaml` parse: this crate only guarantees a
//! well-typed `Config` or a [`crate::error::CoreError::Config`] with the serde
//! error attached. Cross-field validation (paths exist, hosts non-empty) is
//! left to the external CLI front-end.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

fn default_boot_timeout() -> u64 {
    300
}
fn default_test_timeout() -> u64 {
    600
}
fn default_build_timeout() -> u64 {
    1800
}
fn default_ssh_connect_timeout() -> u64 {
    15
}
fn default_test_type() -> TestType {
    TestType::Boot
}
fn default_state_dir() -> String {
    ".".to_string()
}
fn default_database_path() -> String {
    "bisect.db".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Boot,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_boot_timeout")]
    pub boot: u64,
    #[serde(default = "default_test_timeout")]
    pub test: u64,
    #[serde(default = "default_build_timeout")]
    pub build: u64,
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot: default_boot_timeout(),
            test: default_test_timeout(),
            build: default_build_timeout(),
            ssh_connect: default_ssh_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_test_type")]
    pub r#type: TestType,
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub config_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_true")]
    pub collect_baseline: bool,
    #[serde(default = "default_true")]
    pub collect_per_iteration: bool,
    #[serde(default = "default_true")]
    pub collect_kernel_config: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            collect_baseline: true,
            collect_per_iteration: true,
            collect_kernel_config: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelRepoConfig {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Power-control variant named on a host descriptor; `None` is the honest
/// "no automatic recovery" case and is not a serialized variant — it is the
/// absence of `power_control_type` in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerControlType {
    Ipmi,
    Beaker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub hostname: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub kernel_path: Option<String>,
    #[serde(default)]
    pub bisect_path: Option<String>,
    #[serde(default)]
    pub test_script: Option<String>,
    #[serde(default)]
    pub kernel_config_file: Option<String>,
    #[serde(default)]
    pub power_control_type: Option<PowerControlType>,
    /// Variant-specific credentials (BMC address/user/password, beaker host
    /// identity, etc). Kept opaque to this crate — consumed by `power`.
    #[serde(default)]
    pub power_credentials: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub kernel_config: KernelConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub kernel_repo: KernelRepoConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|_| CoreError::ConfigNotFound {
            path: path.to_path_buf(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| CoreError::Config {
            message: e.to_string(),
        })
    }
}
