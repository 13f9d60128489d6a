use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/pve-templates/config.yaml";
pub const DEFAULT_ENV_PATH: &str = "/etc/pve-templates/toolkit.env";
pub const ENV_PREFIX: &str = "PVE_TEMPLATES";

/// Toolkit-wide settings, independent of any single template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Scratch space for image copies while a template is built.
    /// Defaults to "/var/lib/pve-templates/work".
    pub work_dir: PathBuf,
    /// Downloaded cloud images are kept here and reused.
    pub image_cache_dir: PathBuf,
    /// Proxmox storage holding cloud-init snippets, must have the `snippets` content type.
    pub snippets_storage: String,
    /// Local directory backing `snippets_storage`.
    pub snippets_dir: PathBuf,
    /// Timezone set by cloud-init on first boot. Default: "Etc/UTC"
    pub timezone: String,
    pub default_storage: String,
    pub default_bridge: String,
    /// First VMID tried by automatic allocation. Default: 1000
    pub vmid_start: u32,
    /// Last VMID tried by automatic allocation.
    pub vmid_end: u32,
    /// Lock file held while a VMID is allocated and claimed.
    pub vmid_lock_file: PathBuf,
    /// A lock older than this is considered abandoned.
    /// In seconds. Default: 600
    pub vmid_lock_stale_secs: u64,
    /// Attempts for retried operations such as sandbox cleanup.
    pub max_retry_attempts: u32,
    /// In seconds. Default: 5
    pub retry_delay_secs: u64,
    /// Upper bound for any single external command, 0 disables it.
    /// In seconds. Default: 30 min
    pub command_timeout_secs: u64,
    pub sandbox: SandboxSettings,
    pub ansible: AnsibleSettings,
    pub terraform: TerraformSettings,
    /// Directory searched for Docker and Kubernetes workload templates.
    pub workloads_dir: PathBuf,
    /// Extra distributions merged over the built-in registry.
    pub distributions_file: Option<PathBuf>,
    /// Append log output to this file as well as stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            work_dir: PathBuf::from("/var/lib/pve-templates/work"),
            image_cache_dir: PathBuf::from("/var/lib/pve-templates/images"),
            snippets_storage: "local".to_string(),
            snippets_dir: PathBuf::from("/var/lib/vz/snippets"),
            timezone: "Etc/UTC".to_string(),
            default_storage: "local-lvm".to_string(),
            default_bridge: "vmbr0".to_string(),
            vmid_start: 1000,
            vmid_end: 999_999,
            vmid_lock_file: PathBuf::from("/run/lock/pve-templates-vmid.lock"),
            vmid_lock_stale_secs: 600,
            max_retry_attempts: 3,
            retry_delay_secs: 5,
            command_timeout_secs: 1800,
            sandbox: SandboxSettings::default(),
            ansible: AnsibleSettings::default(),
            terraform: TerraformSettings::default(),
            workloads_dir: PathBuf::from("/etc/pve-templates/workloads"),
            distributions_file: None,
            log_file: None,
        }
    }
}

/// Disposable LXC container used to run Docker and Kubernetes workloads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    /// `pct create` ostemplate volume.
    pub ostemplate: String,
    pub storage: String,
    pub bridge: String,
    pub cores: u32,
    /// In MiB
    pub memory: u32,
    /// In GiB
    pub disk_gb: u32,
    /// How long to wait for network inside the container.
    /// In seconds. Default: 60
    pub network_timeout_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        SandboxSettings {
            ostemplate: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".to_string(),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            cores: 2,
            memory: 2048,
            disk_gb: 16,
            network_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AnsibleSettings {
    pub inventory_path: PathBuf,
    /// Generated playbooks are written here.
    pub playbook_dir: PathBuf,
}

impl Default for AnsibleSettings {
    fn default() -> Self {
        AnsibleSettings {
            inventory_path: PathBuf::from("/opt/ansible/inventory/proxmox.yml"),
            playbook_dir: PathBuf::from("/opt/ansible/playbooks"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TerraformSettings {
    /// Root directory of generated modules.
    pub output_dir: PathBuf,
    /// Proxmox API endpoint written into the provider block.
    pub endpoint: String,
    /// Proxmox node the cloned VMs land on.
    pub node: String,
    /// One `.tfvars` file is generated per environment.
    pub environments: Vec<String>,
}

impl Default for TerraformSettings {
    fn default() -> Self {
        TerraformSettings {
            output_dir: PathBuf::from("/opt/terraform/modules"),
            endpoint: "https://localhost:8006/".to_string(),
            node: "pve".to_string(),
            environments: vec!["dev".to_string(), "staging".to_string(), "prod".to_string()],
        }
    }
}

impl Settings {
    /// Load settings from the system file, an optional explicit file and the
    /// environment, in increasing priority.
    ///
    /// A broken system file falls back to the defaults and the error is
    /// returned alongside them, so it can be logged once logging is set up.
    /// An explicitly requested file that cannot be read is an error.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<anyhow::Error>)> {
        dotenv::from_path(DEFAULT_ENV_PATH).ok();
        Self::load_from(Path::new(DEFAULT_SETTINGS_PATH), explicit)
    }

    fn load_from(system: &Path, explicit: Option<&Path>) -> Result<(Self, Option<anyhow::Error>)> {
        let mut builder = Config::builder().add_source(File::from(system).required(false));
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }
        let built = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build();

        match built.and_then(|config| config.try_deserialize::<Settings>()) {
            Ok(settings) => Ok((settings, None)),
            Err(err) if explicit.is_some() => Err(err).with_context(|| {
                let path = explicit.map(|p| p.display().to_string());
                format!("Failed to load settings from {}", path.unwrap_or_default())
            }),
            Err(err) => Ok((
                Settings::default(),
                Some(anyhow::Error::new(err).context(format!(
                    "Failed to load settings from {}, using defaults",
                    system.display()
                ))),
            )),
        }
    }
}
