use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use resources::{config::AnsibleSettings, objects::TemplateConfig};
use rpve::{Cmd, CommandRunner};
use serde::Serialize;

const POST_CONFIG_PLAYBOOK: &str = r#"---
- name: Post-configure VMs cloned from TEMPLATE_NAME
  hosts: HOST_PATTERN
  become: true
  gather_facts: false
  tasks:
    - name: Wait for the VM to accept connections
      ansible.builtin.wait_for_connection:
        timeout: 300

    - name: Gather facts
      ansible.builtin.setup:

    - name: Wait for cloud-init to finish
      ansible.builtin.command: cloud-init status --wait
      changed_when: false
      failed_when: false

    - name: Ensure the guest agent is running
      ansible.builtin.service:
        name: qemu-guest-agent
        state: started
        enabled: true

    - name: Upgrade all packages
      ansible.builtin.package:
        name: "*"
        state: latest
      when: upgrade_packages | default(true) | bool
"#;

/// Dynamic inventory for the `community.general.proxmox` plugin.
///
/// Credentials are left to the plugin's `PROXMOX_USER`/`PROXMOX_PASSWORD`
/// or `PROXMOX_TOKEN_ID`/`PROXMOX_TOKEN_SECRET` environment variables.
#[derive(Debug, Serialize, PartialEq)]
pub struct Inventory {
    plugin: String,
    url: String,
    validate_certs: bool,
    want_facts: bool,
    want_proxmox_nodes_ansible_host: bool,
    keyed_groups: Vec<KeyedGroup>,
    groups: BTreeMap<String, String>,
    compose: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct KeyedGroup {
    key: String,
    prefix: String,
    separator: String,
}

impl Inventory {
    pub fn new(endpoint: &str, ssh_user: &str) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            "templates".to_string(),
            "proxmox_template | default(0) | int == 1".to_string(),
        );
        groups.insert(
            "running".to_string(),
            "proxmox_status == 'running'".to_string(),
        );
        let mut compose = BTreeMap::new();
        compose.insert(
            "ansible_host".to_string(),
            "proxmox_agent_interfaces | default([]) | map(attribute='ip-addresses') | flatten \
             | select('match', '^[0-9.]+/') | reject('match', '^127\\.') | first | default('') \
             | regex_replace('/.*$', '')"
                .to_string(),
        );
        compose.insert("ansible_user".to_string(), format!("'{}'", ssh_user));
        Self {
            plugin: "community.general.proxmox".to_string(),
            url: endpoint.trim_end_matches('/').to_owned(),
            validate_certs: false,
            want_facts: true,
            want_proxmox_nodes_ansible_host: false,
            keyed_groups: vec![KeyedGroup {
                key: "proxmox_tags_parsed".to_string(),
                prefix: "tag".to_string(),
                separator: "_".to_string(),
            }],
            groups,
            compose,
        }
    }

    pub fn render(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(format!(
            "# Generated by create-template\n{}",
            yaml.strip_prefix("---\n").unwrap_or(&yaml)
        ))
    }
}

/// Playbook applied to VMs cloned from `config`'s template when none is given.
///
/// The template itself carries the same name prefix, the inventory's
/// `templates` group excludes it.
pub fn default_playbook(config: &TemplateConfig) -> String {
    POST_CONFIG_PLAYBOOK
        .replace("TEMPLATE_NAME", &config.template_name)
        .replace("HOST_PATTERN", &format!("\"{}*:!templates\"", config.template_name))
}

/// Generated inventory and playbook files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsibleFiles {
    pub inventory: PathBuf,
    pub playbook: PathBuf,
}

pub struct Ansible<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a AnsibleSettings,
}

impl<'a> Ansible<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a AnsibleSettings) -> Self {
        Self {
            runner,
            settings,
        }
    }

    /// Write the inventory, plus the default playbook unless `config` names one.
    pub async fn generate(
        &self,
        config: &TemplateConfig,
        endpoint: &str,
        ssh_user: &str,
    ) -> Result<AnsibleFiles> {
        let inventory = Inventory::new(endpoint, ssh_user).render()?;
        write_file(self.runner, &self.settings.inventory_path, &inventory).await?;
        tracing::info!("Ansible inventory at {}", self.settings.inventory_path.display());

        let playbook = match &config.ansible_playbook {
            Some(playbook) => playbook.to_owned(),
            None => {
                let path = self
                    .settings
                    .playbook_dir
                    .join(format!("{}-post.yml", config.template_name));
                write_file(self.runner, &path, &default_playbook(config)).await?;
                tracing::info!("Default playbook at {}", path.display());
                path
            },
        };
        Ok(AnsibleFiles {
            inventory: self.settings.inventory_path.to_owned(),
            playbook,
        })
    }

    pub async fn run_playbook(
        &self,
        playbook: &Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<String> {
        tracing::info!("Running playbook {}...", playbook.display());
        let mut cmd = Cmd::new("ansible-playbook")
            .opt("-i", self.settings.inventory_path.display().to_string())
            .arg(playbook.display().to_string())
            .env("ANSIBLE_HOST_KEY_CHECKING", "False");
        // ansible splits key=value extra vars on blanks
        if !vars.is_empty() {
            let extra_vars = serde_json::to_string(vars)
                .with_context(|| "Failed to encode extra vars")?;
            cmd = cmd.opt("-e", extra_vars);
        }
        let output = self
            .runner
            .check(&cmd)
            .await
            .with_context(|| format!("Playbook {} failed", playbook.display()))?;
        Ok(output.stdout)
    }
}

async fn write_file(runner: &dyn CommandRunner, path: &Path, content: &str) -> Result<()> {
    if runner.is_dry_run() {
        tracing::info!("[dry-run] would write {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
