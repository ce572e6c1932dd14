//! Infrastructure modules and the `terraform` runner.
//!
//! Each module (`provision`, `talos`, `bootstrap`) is copied from the modules
//! directory into its own workspace under the cluster output directory,
//! given a generated `terraform.tfvars.json`, and applied there. Outputs are
//! read back with `terraform output -json` and decoded into typed records.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::state::StorageDisk;

/// Name of the generated variables file.
pub const TFVARS_FILE: &str = "terraform.tfvars.json";

/// Infrastructure module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    /// Installs Talos from the rescue system and reports disks.
    Provision,
    /// Generates machine configurations and bootstraps the cluster.
    Talos,
    /// In-cluster components applied after the API is healthy.
    Bootstrap,
}

impl Module {
    /// Directory name under the modules and output directories.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Talos => "talos",
            Self::Bootstrap => "bootstrap",
        }
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One entry of `terraform output -json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputValue {
    #[serde(default)]
    pub sensitive: bool,
    pub value: serde_json::Value,
}

/// Raw outputs keyed by output name.
pub type OutputMap = BTreeMap<String, OutputValue>;

/// Errors decoding module outputs.
#[derive(Error, Debug)]
pub enum OutputError {
    /// A required output is absent.
    #[error("output '{key}' is missing")]
    Missing { key: String },

    /// An output does not have the expected shape.
    #[error("output '{key}' has an unexpected shape: {source}")]
    Invalid {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a required output.
///
/// # Errors
///
/// Returns [`OutputError::Missing`] or [`OutputError::Invalid`].
pub fn required<T: DeserializeOwned>(outputs: &OutputMap, key: &str) -> Result<T, OutputError> {
    optional(outputs, key)?.ok_or_else(|| OutputError::Missing {
        key: key.to_string(),
    })
}

/// Decode an output that may be absent.
///
/// # Errors
///
/// Returns [`OutputError::Invalid`] if present with the wrong shape.
pub fn optional<T: DeserializeOwned>(
    outputs: &OutputMap,
    key: &str,
) -> Result<Option<T>, OutputError> {
    outputs
        .get(key)
        .map(|o| {
            serde_json::from_value(o.value.clone()).map_err(|source| OutputError::Invalid {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
}

/// Runs the infrastructure tool in a module workspace.
#[async_trait]
pub trait TerraformRunner: Send + Sync {
    /// `terraform init`.
    async fn init(&self, dir: &Path) -> Result<()>;

    /// `terraform validate`.
    async fn validate(&self, dir: &Path) -> Result<()>;

    /// `terraform apply -auto-approve`.
    async fn apply(&self, dir: &Path) -> Result<()>;

    /// `terraform output -json`.
    async fn output(&self, dir: &Path) -> Result<OutputMap>;
}

/// [`TerraformRunner`] over the `terraform` binary.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: PathBuf,
}

impl TerraformCli {
    /// Find `terraform` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is not installed.
    pub fn locate() -> Result<Self> {
        let binary = which::which("terraform")
            .context("terraform not found in PATH; install it from https://developer.hashicorp.com/terraform/install")?;
        debug!(binary = %binary.display(), "Found terraform");
        Ok(Self { binary })
    }

    /// Use a specific binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
        let chdir = format!("-chdir={}", dir.display());
        let command = format!("terraform {}", args.join(" "));
        debug!(dir = %dir.display(), command = %command, "Running");

        let spinner = crate::ui::spinner(&command);
        let output = Command::new(&self.binary)
            .arg(&chdir)
            .args(args)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {command}"));
        spinner.finish_and_clear();
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            bail!("{command} failed in {}:\n{detail}", dir.display());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl TerraformRunner for TerraformCli {
    async fn init(&self, dir: &Path) -> Result<()> {
        self.run(dir, &["init", "-input=false", "-no-color"]).await?;
        Ok(())
    }

    async fn validate(&self, dir: &Path) -> Result<()> {
        self.run(dir, &["validate", "-no-color"]).await?;
        Ok(())
    }

    async fn apply(&self, dir: &Path) -> Result<()> {
        self.run(dir, &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    async fn output(&self, dir: &Path) -> Result<OutputMap> {
        let stdout = self.run(dir, &["output", "-json"]).await?;
        serde_json::from_slice(&stdout).context("Failed to parse terraform output")
    }
}

/// Copy a module into its workspace and write its variables.
///
/// Existing state and provider caches in the workspace are left alone.
///
/// # Errors
///
/// Returns an error if the module is missing or a file cannot be written.
pub fn prepare_workspace<V: Serialize>(source: &Path, workspace: &Path, vars: &V) -> Result<()> {
    if !source.is_dir() {
        bail!("Infrastructure module not found at {}", source.display());
    }
    copy_module(source, workspace)?;
    let content = serde_json::to_string_pretty(vars).context("Failed to serialize variables")?;
    write_secret(&workspace.join(TFVARS_FILE), &content)
        .with_context(|| format!("Failed to write variables in {}", workspace.display()))?;
    info!(module = %source.display(), workspace = %workspace.display(), "Prepared workspace");
    Ok(())
}

fn copy_module(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    for entry in
        fs::read_dir(source).with_context(|| format!("Failed to read {}", source.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == ".terraform" || name_str.starts_with("terraform.tfstate") {
            continue;
        }
        let path = entry.path();
        let target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_module(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Prepare, init, validate, apply and read outputs of one module.
///
/// # Errors
///
/// Returns the first failing step's error.
pub async fn apply_module<V: Serialize + Sync>(
    runner: &dyn TerraformRunner,
    source: &Path,
    workspace: &Path,
    vars: &V,
) -> Result<OutputMap> {
    prepare_workspace(source, workspace, vars)?;
    runner.init(workspace).await?;
    runner.validate(workspace).await?;
    runner.apply(workspace).await?;
    runner.output(workspace).await
}

// Variables

/// Server entry for the provision module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionServer {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rescue_password: Option<String>,
}

/// Variables for the provision module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionVars {
    pub cluster_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,
    pub servers: Vec<ProvisionServer>,
}

/// Node entry for the Talos module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TalosNode {
    pub id: String,
    pub name: String,
    pub role: String,
    pub public_ip: String,
    pub private_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_disk: Option<String>,
    pub storage_disks: Vec<StorageDisk>,
}

/// Variables for the Talos module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TalosVars {
    pub cluster_name: String,
    pub cluster_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,
    pub vlan_id: u16,
    pub vswitch_id: String,
    pub cluster_network: String,
    pub vswitch_subnet: String,
    pub vswitch_gateway: String,
    pub load_balancer_subnet: String,
    pub nodes: Vec<TalosNode>,
}

/// Variables for the bootstrap module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapVars {
    pub cluster_name: String,
    pub kubeconfig_path: String,
    pub cluster_endpoint: String,
    pub load_balancer_subnet: String,
}

// Outputs

/// Disk chosen for the operating system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OsInstallation {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub disk_by_id: String,
    #[serde(default)]
    pub disk_by_id_path: String,
    #[serde(default)]
    pub full_path: String,
}

/// One block device reported by the provision module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiskDevice {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub disk_by_id: String,
}

/// `server_<id>_disk_discovery` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiskDiscovery {
    #[serde(default)]
    pub os_installation: Option<OsInstallation>,
    #[serde(default)]
    pub all_devices: Vec<DiskDevice>,
}

impl DiskDiscovery {
    /// Output key for a server.
    #[must_use]
    pub fn output_key(server_id: &str) -> String {
        format!("server_{server_id}_disk_discovery")
    }

    /// Install disk: the by-id path, else the kernel path.
    #[must_use]
    pub fn install_disk(&self) -> Option<String> {
        let os = self.os_installation.as_ref()?;
        [&os.disk_by_id_path, &os.full_path]
            .into_iter()
            .find(|p| !p.is_empty())
            .cloned()
    }

    /// Every other device with a stable id.
    #[must_use]
    pub fn storage_disks(&self) -> Vec<StorageDisk> {
        let install_id = self
            .os_installation
            .as_ref()
            .map(|os| os.disk_by_id.as_str())
            .unwrap_or_default();
        self.all_devices
            .iter()
            .filter(|d| !d.disk_by_id.is_empty() && d.disk_by_id != install_id)
            .enumerate()
            .map(|(i, d)| StorageDisk {
                name: format!("storage-disk-{i}"),
                path: format!("/dev/disk/by-id/{}", d.disk_by_id),
            })
            .collect()
    }
}

/// Disk discovery per server id; servers without the output are skipped.
///
/// # Errors
///
/// Returns an error if an output exists with the wrong shape.
pub fn disk_discovery(
    outputs: &OutputMap,
    server_ids: &[String],
) -> Result<BTreeMap<String, DiskDiscovery>, OutputError> {
    let mut found = BTreeMap::new();
    for id in server_ids {
        let key = DiskDiscovery::output_key(id);
        match optional::<DiskDiscovery>(outputs, &key)? {
            Some(discovery) => {
                found.insert(id.clone(), discovery);
            }
            None => warn!(server_id = %id, key = %key, "No disk discovery output"),
        }
    }
    Ok(found)
}

/// Outputs of the Talos module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalosOutputs {
    pub kubeconfig: String,
    pub talos_config: String,
    /// Machine configuration per control plane server id.
    pub control_plane_configs: BTreeMap<String, String>,
    /// Machine configuration per worker server id.
    pub worker_configs: BTreeMap<String, String>,
}

impl TalosOutputs {
    /// Decode from raw outputs.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Missing`] if the kubeconfig, talosconfig or
    /// control plane configurations are absent.
    pub fn from_outputs(outputs: &OutputMap) -> Result<Self, OutputError> {
        Ok(Self {
            kubeconfig: required(outputs, "kubeconfig")?,
            talos_config: required(outputs, "talos_config")?,
            control_plane_configs: required(outputs, "control_plane_machine_configurations")?,
            worker_configs: optional(outputs, "worker_machine_configurations")?
                .unwrap_or_default(),
        })
    }
}

/// SSH keypair the provision module generates for the rescue system.
#[derive(Clone, PartialEq, Eq)]
pub struct SshKeypair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for SshKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl SshKeypair {
    /// Decode `ssh_private_key` and `ssh_public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::Missing`] if either key is absent.
    pub fn from_outputs(outputs: &OutputMap) -> Result<Self, OutputError> {
        Ok(Self {
            private_key: required(outputs, "ssh_private_key")?,
            public_key: required(outputs, "ssh_public_key")?,
        })
    }
}

/// Write the keypair to `<credentials_dir>/.ssh/id_rsa{,.pub}`.
///
/// Returns the private key path.
///
/// # Errors
///
/// Returns an error if the directory or a key file cannot be written.
pub fn write_ssh_keypair(keypair: &SshKeypair, credentials_dir: &Path) -> Result<PathBuf> {
    let ssh_dir = credentials_dir.join(".ssh");
    create_private_dir(credentials_dir)?;
    create_private_dir(&ssh_dir)?;

    let private_key = ssh_dir.join("id_rsa");
    write_secret(&private_key, &keypair.private_key)?;
    write_secret(&ssh_dir.join("id_rsa.pub"), &keypair.public_key)?;
    Ok(private_key)
}

/// Files written by [`write_talos_credentials`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrittenCredentials {
    pub kubeconfig: PathBuf,
    pub talosconfig: PathBuf,
    pub machine_configs: Vec<PathBuf>,
}

/// Write client credentials and machine configurations with owner-only access.
///
/// # Errors
///
/// Returns an error if a directory or file cannot be written.
pub fn write_talos_credentials(
    outputs: &TalosOutputs,
    talos_dir: &Path,
    credentials_dir: &Path,
) -> Result<WrittenCredentials> {
    create_private_dir(talos_dir)?;
    create_private_dir(credentials_dir)?;

    let kubeconfig = talos_dir.join("kubeconfig");
    write_secret(&kubeconfig, &outputs.kubeconfig)?;
    let talosconfig = talos_dir.join("talosconfig");
    write_secret(&talosconfig, &outputs.talos_config)?;

    let mut machine_configs = Vec::new();
    for (id, config) in &outputs.control_plane_configs {
        let path = credentials_dir.join(format!("controlplane-{id}.yaml"));
        write_secret(&path, config)?;
        machine_configs.push(path);
    }
    for (id, config) in &outputs.worker_configs {
        let path = credentials_dir.join(format!("worker-node-{id}.yaml"));
        write_secret(&path, config)?;
        machine_configs.push(path);
    }

    Ok(WrittenCredentials {
        kubeconfig,
        talosconfig,
        machine_configs,
    })
}

fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to restrict {}", dir.display()))?;
    }
    Ok(())
}

/// Write a file readable only by the owner.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_secret(path: &Path, content: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    debug!(path = %path.display(), "Wrote secret");
    Ok(())
}
