//! Cluster configuration record.
//!
//! The record is a small YAML file naming the cluster, its DNS domain, the
//! topology and, optionally, the ordered list of Robot server ids to use.
//! Everything the provisioning run discovers is written to the cluster state
//! file instead (see [`crate::state`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use robot_metal::topology::validate_selection;
use robot_metal::ClusterTopology;
use serde::{Deserialize, Serialize};

/// Root directory for per-cluster output when none is configured.
pub const DEFAULT_OUTPUT_ROOT: &str = ".robot";

/// Directory holding the infrastructure modules when none is configured.
pub const DEFAULT_MODULES_DIR: &str = "infrastructure";

/// Cluster configuration loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name; also the vSwitch name.
    pub name: String,
    /// DNS domain; the API endpoint is `kube.<domain>`.
    pub domain: String,
    /// Control plane layout.
    pub topology: ClusterTopology,
    /// Robot server ids in selection order. Empty means pick interactively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
    /// Output directory for state, generated files and credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Directory holding the `provision`, `talos` and `bootstrap` modules.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,
    /// Talos version passed to the infrastructure modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,
    /// Wait budget overrides.
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MODULES_DIR)
}

/// Optional overrides for the post-provision wait budgets, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_secs: Option<u64>,
}

/// Poll interval and budget for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub interval: Duration,
    pub timeout: Duration,
}

impl WaitBudget {
    const fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn with_override(self, timeout_secs: Option<u64>) -> Self {
        match timeout_secs {
            Some(secs) => Self {
                timeout: Duration::from_secs(secs),
                ..self
            },
            None => self,
        }
    }
}

/// Resolved wait budgets for the phases after selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Talos API reachable after the provision apply.
    pub availability: WaitBudget,
    /// Maintenance API answering before discovery.
    pub maintenance: WaitBudget,
    /// DNS propagation of the endpoint records.
    pub dns: WaitBudget,
    /// ICMP and Kubernetes API after bootstrap.
    pub health: WaitBudget,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            availability: WaitBudget::new(15, 5 * 60),
            maintenance: WaitBudget::new(15, 10 * 60),
            dns: WaitBudget::new(60, 60 * 60),
            health: WaitBudget::new(15, 5 * 60),
        }
    }
}

impl ClusterConfig {
    /// Minimal configuration with defaults for everything optional.
    #[must_use]
    pub fn with_defaults(name: String, domain: String, topology: ClusterTopology) -> Self {
        Self {
            name,
            domain,
            topology,
            servers: Vec::new(),
            output_dir: None,
            modules_dir: default_modules_dir(),
            talos_version: None,
            timeouts: TimeoutOverrides::default(),
        }
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.name) {
            bail!(
                "Invalid cluster name '{}': use lowercase letters, digits and '-', at most 63 characters",
                self.name
            );
        }
        if self.domain.is_empty() || !self.domain.split('.').all(is_dns_label) {
            bail!("Invalid domain '{}'", self.domain);
        }
        if !self.servers.is_empty() {
            validate_selection(self.topology, &self.servers)
                .context("Invalid server list in config")?;
        }
        Ok(())
    }

    /// Resolved wait budgets.
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        let defaults = Timeouts::default();
        Timeouts {
            availability: defaults
                .availability
                .with_override(self.timeouts.availability_secs),
            maintenance: defaults
                .maintenance
                .with_override(self.timeouts.maintenance_secs),
            dns: defaults.dns.with_override(self.timeouts.dns_secs),
            health: defaults.health.with_override(self.timeouts.health_secs),
        }
    }

    /// Output directory, `.robot/<name>` by default.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_ROOT).join(&self.name))
    }

    /// Directory for Talos client credentials.
    #[must_use]
    pub fn talos_dir(&self) -> PathBuf {
        self.output_dir().join("talos")
    }

    /// Directory for machine configurations.
    #[must_use]
    pub fn credentials_dir(&self) -> PathBuf {
        self.output_dir().join("credentials")
    }

    /// Path of the written kubeconfig.
    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.talos_dir().join("kubeconfig")
    }

    /// Path of the written talosconfig.
    #[must_use]
    pub fn talosconfig_path(&self) -> PathBuf {
        self.talos_dir().join("talosconfig")
    }

    /// DNS name of the Kubernetes API endpoint.
    #[must_use]
    pub fn endpoint_host(&self) -> String {
        format!("kube.{}", self.domain)
    }

    /// Kubernetes API endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!(
            "https://{}:{}",
            self.endpoint_host(),
            robot_metal::probe::K8S_API_PORT
        )
    }
}

fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
