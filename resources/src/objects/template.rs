use std::{collections::BTreeMap, fmt::Write, path::PathBuf};

use anyhow::{Context, Result};
use indenter::indented;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    config::ConfFile,
    models::ToolkitError,
    utils::{join_key_values, parse_key_values, split_list},
};

pub const MIN_VMID: u32 = 100;
pub const MAX_VMID: u32 = 999_999_999;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Bios {
    Seabios,
    Ovmf,
}

impl Default for Bios {
    fn default() -> Self {
        Bios::Seabios
    }
}

/// Everything needed to build a single VM template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfig {
    /// Registry key of the distribution, e.g. `debian-12`.
    pub distribution: String,
    /// VM name of the template. Must be a valid DNS name.
    pub template_name: String,
    /// Requested VMID, allocated automatically when `None`.
    pub vmid: Option<u32>,
    pub cores: u32,
    /// In MiB
    pub memory: u32,
    /// Final size of the boot disk, e.g. `20G`.
    pub disk_size: String,
    pub storage: String,
    pub bridge: String,
    pub vlan: Option<u16>,
    pub cpu_type: String,
    pub machine: String,
    pub bios: Bios,
    /// Cloud-init user, the distribution default when `None`.
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    /// Public key file injected through cloud-init.
    pub ssh_key_file: Option<PathBuf>,
    /// `--ipconfig0` value, e.g. `ip=dhcp` or `ip=10.0.0.5/24,gw=10.0.0.1`.
    pub ip_config: String,
    pub nameserver: Option<String>,
    pub tags: Vec<String>,
    /// Packages baked into the image with virt-customize.
    pub packages: Vec<String>,
    pub docker_template: Option<String>,
    pub k8s_template: Option<String>,
    pub ansible_playbook: Option<PathBuf>,
    pub ansible_vars: BTreeMap<String, String>,
    pub terraform_module: Option<String>,
    pub terraform_vars: BTreeMap<String, String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            distribution: String::new(),
            template_name: String::new(),
            vmid: None,
            cores: 2,
            memory: 2048,
            disk_size: "20G".to_string(),
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            vlan: None,
            cpu_type: "host".to_string(),
            machine: "q35".to_string(),
            bios: Bios::default(),
            ci_user: None,
            ci_password: None,
            ssh_key_file: None,
            ip_config: "ip=dhcp".to_string(),
            nameserver: None,
            tags: vec![],
            packages: vec![],
            docker_template: None,
            k8s_template: None,
            ansible_playbook: None,
            ansible_vars: BTreeMap::new(),
            terraform_module: None,
            terraform_vars: BTreeMap::new(),
        }
    }
}

/// Keys understood in `.conf` files, in export order.
pub mod keys {
    pub const DISTRIBUTION: &str = "DISTRIBUTION";
    pub const TEMPLATE_NAME: &str = "TEMPLATE_NAME";
    pub const VMID: &str = "VMID";
    pub const CORES: &str = "CORES";
    pub const MEMORY: &str = "MEMORY";
    pub const DISK_SIZE: &str = "DISK_SIZE";
    pub const STORAGE: &str = "STORAGE";
    pub const BRIDGE: &str = "BRIDGE";
    pub const VLAN: &str = "VLAN";
    pub const CPU_TYPE: &str = "CPU_TYPE";
    pub const MACHINE: &str = "MACHINE";
    pub const BIOS: &str = "BIOS";
    pub const CI_USER: &str = "CI_USER";
    pub const CI_PASSWORD: &str = "CI_PASSWORD";
    pub const SSH_KEY_FILE: &str = "SSH_KEY_FILE";
    pub const IP_CONFIG: &str = "IP_CONFIG";
    pub const NAMESERVER: &str = "NAMESERVER";
    pub const TAGS: &str = "TAGS";
    pub const PACKAGES: &str = "PACKAGES";
    pub const DOCKER_TEMPLATE: &str = "DOCKER_TEMPLATE";
    pub const K8S_TEMPLATE: &str = "K8S_TEMPLATE";
    pub const ANSIBLE_PLAYBOOK: &str = "ANSIBLE_PLAYBOOK";
    pub const ANSIBLE_VARS: &str = "ANSIBLE_VARS";
    pub const TERRAFORM_MODULE: &str = "TERRAFORM_MODULE";
    pub const TERRAFORM_VARS: &str = "TERRAFORM_VARS";
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ToolkitError::invalid(format!("{} must be a number, got '{}'", key, value)).into()
    })
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

impl TemplateConfig {
    /// Overlay the assignments of a config file, returning keys that were not understood.
    pub fn apply_conf(&mut self, conf: &ConfFile) -> Result<Vec<String>> {
        let mut unknown = vec![];
        for (key, value) in conf.iter() {
            match key {
                keys::DISTRIBUTION => self.distribution = value.to_owned(),
                keys::TEMPLATE_NAME => self.template_name = value.to_owned(),
                keys::VMID => {
                    self.vmid = match value {
                        "" | "auto" => None,
                        _ => Some(parse_number(key, value)?),
                    }
                },
                keys::CORES => self.cores = parse_number(key, value)?,
                keys::MEMORY => self.memory = parse_number(key, value)?,
                keys::DISK_SIZE => self.disk_size = value.to_owned(),
                keys::STORAGE => self.storage = value.to_owned(),
                keys::BRIDGE => self.bridge = value.to_owned(),
                keys::VLAN => {
                    self.vlan = match value {
                        "" => None,
                        _ => Some(parse_number(key, value)?),
                    }
                },
                keys::CPU_TYPE => self.cpu_type = value.to_owned(),
                keys::MACHINE => self.machine = value.to_owned(),
                keys::BIOS => {
                    self.bios = value.parse().map_err(|_| {
                        ToolkitError::invalid(format!("BIOS must be seabios or ovmf, got '{}'", value))
                    })?
                },
                keys::CI_USER => self.ci_user = optional(value),
                keys::CI_PASSWORD => self.ci_password = optional(value),
                keys::SSH_KEY_FILE => self.ssh_key_file = optional(value).map(PathBuf::from),
                keys::IP_CONFIG => self.ip_config = value.to_owned(),
                keys::NAMESERVER => self.nameserver = optional(value),
                keys::TAGS => self.tags = split_list(value),
                keys::PACKAGES => self.packages = split_list(value),
                keys::DOCKER_TEMPLATE => self.docker_template = optional(value),
                keys::K8S_TEMPLATE => self.k8s_template = optional(value),
                keys::ANSIBLE_PLAYBOOK => self.ansible_playbook = optional(value).map(PathBuf::from),
                keys::ANSIBLE_VARS => {
                    self.ansible_vars = parse_key_values(value).map_err(ToolkitError::invalid)?
                },
                keys::TERRAFORM_MODULE => self.terraform_module = optional(value),
                keys::TERRAFORM_VARS => {
                    self.terraform_vars = parse_key_values(value).map_err(ToolkitError::invalid)?
                },
                _ => {
                    tracing::warn!("Ignoring unknown config key {}", key);
                    unknown.push(key.to_owned());
                },
            }
        }
        Ok(unknown)
    }

    pub fn from_conf(conf: &ConfFile) -> Result<Self> {
        let mut config = Self::default();
        config.apply_conf(conf)?;
        Ok(config)
    }

    pub fn to_conf(&self) -> ConfFile {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        let text = |s: &Option<String>| s.clone().unwrap_or_default();

        let mut conf = ConfFile::new();
        conf.set(keys::DISTRIBUTION, &self.distribution);
        conf.set(keys::TEMPLATE_NAME, &self.template_name);
        conf.set(
            keys::VMID,
            self.vmid.map_or_else(|| "auto".to_string(), |id| id.to_string()),
        );
        conf.set(keys::CORES, self.cores.to_string());
        conf.set(keys::MEMORY, self.memory.to_string());
        conf.set(keys::DISK_SIZE, &self.disk_size);
        conf.set(keys::STORAGE, &self.storage);
        conf.set(keys::BRIDGE, &self.bridge);
        conf.set(
            keys::VLAN,
            self.vlan.map(|v| v.to_string()).unwrap_or_default(),
        );
        conf.set(keys::CPU_TYPE, &self.cpu_type);
        conf.set(keys::MACHINE, &self.machine);
        conf.set(keys::BIOS, self.bios.to_string());
        conf.set(keys::CI_USER, text(&self.ci_user));
        conf.set(keys::CI_PASSWORD, text(&self.ci_password));
        conf.set(keys::SSH_KEY_FILE, path(&self.ssh_key_file));
        conf.set(keys::IP_CONFIG, &self.ip_config);
        conf.set(keys::NAMESERVER, text(&self.nameserver));
        conf.set(keys::TAGS, self.tags.join(" "));
        conf.set(keys::PACKAGES, self.packages.join(" "));
        conf.set(keys::DOCKER_TEMPLATE, text(&self.docker_template));
        conf.set(keys::K8S_TEMPLATE, text(&self.k8s_template));
        conf.set(keys::ANSIBLE_PLAYBOOK, path(&self.ansible_playbook));
        conf.set(keys::ANSIBLE_VARS, join_key_values(&self.ansible_vars));
        conf.set(keys::TERRAFORM_MODULE, text(&self.terraform_module));
        conf.set(keys::TERRAFORM_VARS, join_key_values(&self.terraform_vars));
        conf
    }

    /// Check everything that can be checked without talking to Proxmox.
    pub fn validate(&self) -> Result<()> {
        if self.distribution.is_empty() {
            return Err(ToolkitError::invalid("no distribution selected").into());
        }
        validate_name(&self.template_name)?;
        if let Some(vmid) = self.vmid {
            validate_vmid(vmid)?;
        }
        if self.cores == 0 {
            return Err(ToolkitError::invalid("cores must be at least 1").into());
        }
        if self.memory < 128 {
            return Err(ToolkitError::invalid(format!(
                "memory must be at least 128 MiB, got {}",
                self.memory
            ))
            .into());
        }
        parse_disk_size(&self.disk_size)?;
        if let Some(vlan) = self.vlan {
            if !(1..=4094).contains(&vlan) {
                return Err(ToolkitError::invalid(format!("VLAN tag {} out of range", vlan)).into());
            }
        }
        if self.storage.is_empty() || self.bridge.is_empty() {
            return Err(ToolkitError::invalid("storage and bridge must be set").into());
        }
        for tag in &self.tags {
            if !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(ToolkitError::invalid(format!("invalid tag '{}'", tag)).into());
            }
        }
        Ok(())
    }

    /// `net0` value for `qm create`.
    pub fn net0(&self) -> String {
        let mut net = format!("virtio,bridge={}", self.bridge);
        if let Some(vlan) = self.vlan {
            write!(net, ",tag={}", vlan).ok();
        }
        net
    }

    pub fn wants_workloads(&self) -> bool {
        self.docker_template.is_some() || self.k8s_template.is_some()
    }
}

/// Template names follow the Proxmox DNS name rule.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| -> anyhow::Error {
        ToolkitError::invalid(format!("template name '{}' {}", name, reason)).into()
    };
    if name.is_empty() {
        return Err(invalid("is empty"));
    }
    if name.len() > 63 {
        return Err(invalid("is longer than 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(invalid("may only contain letters, digits, '-' and '.'"));
    }
    if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
        return Err(invalid("must start and end with a letter or digit"));
    }
    Ok(())
}

pub fn validate_vmid(vmid: u32) -> Result<()> {
    if (MIN_VMID..=MAX_VMID).contains(&vmid) {
        Ok(())
    } else {
        Err(ToolkitError::invalid(format!(
            "VMID {} must be between {} and {}",
            vmid, MIN_VMID, MAX_VMID
        ))
        .into())
    }
}

/// Parse a Proxmox disk size such as `20G` or `512M` into bytes.
pub fn parse_disk_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let (number, unit) = match size.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&size[..i], c.to_ascii_uppercase()),
        _ => (size, 'G'),
    };
    let multiplier: u64 = match unit {
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return Err(ToolkitError::invalid(format!("unknown disk size unit in '{}'", size)).into()),
    };
    let number: u64 = number
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ToolkitError::invalid(format!("invalid disk size '{}'", size)))
        .with_context(|| "Disk size must look like 20G")?;
    let bytes = number
        .checked_mul(multiplier)
        .ok_or_else(|| ToolkitError::invalid(format!("disk size '{}' is too large", size)))?;
    Ok(bytes)
}

impl std::fmt::Display for TemplateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<16} {}", "Name:", self.template_name)?;
        writeln!(f, "{:<16} {}", "Distribution:", self.distribution)?;
        match self.vmid {
            Some(vmid) => writeln!(f, "{:<16} {}", "VMID:", vmid)?,
            None => writeln!(f, "{:<16} auto", "VMID:")?,
        }
        writeln!(f, "Hardware:")?;
        writeln!(indented(f), "{:<12} {} ({})", "CPU:", self.cores, self.cpu_type)?;
        writeln!(indented(f), "{:<12} {} MiB", "Memory:", self.memory)?;
        writeln!(indented(f), "{:<12} {} on {}", "Disk:", self.disk_size, self.storage)?;
        writeln!(indented(f), "{:<12} {}", "Network:", self.net0())?;
        writeln!(indented(f), "{:<12} {} / {}", "Machine:", self.machine, self.bios)?;
        writeln!(f, "Cloud-init:")?;
        writeln!(
            indented(f),
            "{:<12} {}",
            "User:",
            self.ci_user.as_deref().unwrap_or("(distribution default)")
        )?;
        writeln!(indented(f), "{:<12} {}", "IP:", self.ip_config)?;
        if let Some(key) = &self.ssh_key_file {
            writeln!(indented(f), "{:<12} {}", "SSH key:", key.display())?;
        }
        if !self.packages.is_empty() {
            writeln!(f, "{:<16} {}", "Packages:", self.packages.join(" "))?;
        }
        if let Some(docker) = &self.docker_template {
            writeln!(f, "{:<16} {}", "Docker:", docker)?;
        }
        if let Some(k8s) = &self.k8s_template {
            writeln!(f, "{:<16} {}", "Kubernetes:", k8s)?;
        }
        if let Some(playbook) = &self.ansible_playbook {
            writeln!(f, "{:<16} {}", "Ansible:", playbook.display())?;
        }
        if let Some(module) = &self.terraform_module {
            writeln!(f, "{:<16} {}", "Terraform:", module)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{exit_code_of, ExitCode};

    fn sample() -> TemplateConfig {
        TemplateConfig {
            distribution: "debian-12".to_string(),
            template_name: "debian-12-docker".to_string(),
            vmid: Some(9000),
            cores: 4,
            memory: 4096,
            vlan: Some(20),
            bios: Bios::Ovmf,
            ci_user: Some("admin".to_string()),
            ssh_key_file: Some(PathBuf::from("/root/.ssh/id_ed25519.pub")),
            nameserver: Some("1.1.1.1".to_string()),
            tags: vec!["linux".to_string(), "docker".to_string()],
            packages: vec!["qemu-guest-agent".to_string(), "curl".to_string()],
            docker_template: Some("portainer".to_string()),
            ansible_vars: [("timezone".to_string(), "Europe/Madrid".to_string())].into(),
            terraform_module: Some("web".to_string()),
            terraform_vars: [("replicas".to_string(), "3".to_string())].into(),
            ..Default::default()
        }
    }

    #[test]
    fn conf_round_trip() {
        let config = sample();
        let reloaded = TemplateConfig::from_conf(&config.to_conf()).unwrap();
        assert_eq!(reloaded, config);

        let defaults = TemplateConfig::default();
        assert_eq!(TemplateConfig::from_conf(&defaults.to_conf()).unwrap(), defaults);
    }

    #[test]
    fn conf_round_trip_through_text() {
        let config = sample();
        let text = config.to_conf().to_string();
        let reloaded = TemplateConfig::from_conf(&ConfFile::parse(&text).unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn vars_with_spaces_survive_export() {
        let mut config = sample();
        config
            .ansible_vars
            .insert("motd".to_string(), "hello world".to_string());
        config
            .terraform_vars
            .insert("description".to_string(), "it's \"built\"".to_string());
        let text = config.to_conf().to_string();
        let reloaded = TemplateConfig::from_conf(&ConfFile::parse(&text).unwrap()).unwrap();
        assert_eq!(reloaded.ansible_vars["motd"], "hello world");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn unknown_keys_are_reported() {
        let conf = ConfFile::parse("DISTRIBUTION=arch\nFAVOURITE_COLOUR=blue\n").unwrap();
        let mut config = TemplateConfig::default();
        let unknown = config.apply_conf(&conf).unwrap();
        assert_eq!(unknown, vec!["FAVOURITE_COLOUR"]);
        assert_eq!(config.distribution, "arch");
    }

    #[test]
    fn bad_numbers_are_invalid_parameters() {
        let conf = ConfFile::parse("VMID=abc\n").unwrap();
        let err = TemplateConfig::from_conf(&conf).unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
    }

    #[test]
    fn validate_accepts_sample() {
        sample().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut TemplateConfig)>> = vec![
            Box::new(|c| c.distribution.clear()),
            Box::new(|c| c.template_name = "-leading".into()),
            Box::new(|c| c.template_name = "under_score".into()),
            Box::new(|c| c.template_name = "x".repeat(64)),
            Box::new(|c| c.vmid = Some(99)),
            Box::new(|c| c.cores = 0),
            Box::new(|c| c.memory = 64),
            Box::new(|c| c.disk_size = "lots".into()),
            Box::new(|c| c.vlan = Some(5000)),
            Box::new(|c| c.tags = vec!["has space".into()]),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = sample();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters, "case {}", i);
        }
    }

    #[test]
    fn disk_sizes() {
        assert_eq!(parse_disk_size("20G").unwrap(), 20 << 30);
        assert_eq!(parse_disk_size("512m").unwrap(), 512 << 20);
        assert_eq!(parse_disk_size("8").unwrap(), 8 << 30);
        assert!(parse_disk_size("0G").is_err());
        assert!(parse_disk_size("10X").is_err());

        let err = parse_disk_size("20000000T").unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
        assert!(parse_disk_size(&format!("{}K", u64::MAX)).is_err());
    }

    #[test]
    fn net0_includes_vlan() {
        let mut config = sample();
        assert_eq!(config.net0(), "virtio,bridge=vmbr0,tag=20");
        config.vlan = None;
        assert_eq!(config.net0(), "virtio,bridge=vmbr0");
    }
}
