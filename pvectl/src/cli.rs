use std::{io, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use clap_complete::Shell;
use resources::{
    config::{ConfFile, Settings},
    objects::TemplateConfig,
    utils::{parse_key_value, split_list},
};

use crate::app::Options;

/// Create Proxmox VE VM templates from cloud images, provision Docker and
/// Kubernetes workloads in disposable containers and generate Terraform and
/// Ansible artifacts for the clones.
///
/// Without template parameters on a terminal an interactive menu starts.
#[derive(Parser, Debug)]
#[clap(name = "create-template", author, version, about, long_about = None)]
pub struct Cli {
    /// Distribution to build from, see --list-distributions
    #[clap(long, value_name = "KEY")]
    pub distribution: Option<String>,
    /// Name of the template VM
    #[clap(long, value_name = "NAME")]
    pub template_name: Option<String>,
    /// VMID of the template, the next free one when omitted
    #[clap(long)]
    pub vmid: Option<u32>,
    #[clap(long)]
    pub cores: Option<u32>,
    /// Memory in MiB
    #[clap(long)]
    pub memory: Option<u32>,
    /// Boot disk size, e.g. 20G
    #[clap(long, value_name = "SIZE")]
    pub disk_size: Option<String>,
    /// Storage receiving the boot disk
    #[clap(long)]
    pub storage: Option<String>,
    /// Network bridge of net0
    #[clap(long)]
    pub bridge: Option<String>,
    /// Public key injected through cloud-init
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub ssh_key: Option<PathBuf>,
    /// Packages installed into the image, comma or space separated
    #[clap(long, value_name = "LIST")]
    pub packages: Option<String>,
    /// Docker workload to provision in a sandbox container
    #[clap(long, value_name = "NAME|FILE")]
    pub docker_template: Option<String>,
    /// Kubernetes workload to provision in a sandbox container
    #[clap(long, value_name = "NAME|FILE")]
    pub k8s_template: Option<String>,
    /// Playbook run against clones of the template
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub ansible_playbook: Option<PathBuf>,
    /// Extra variable passed to ansible-playbook, repeatable
    #[clap(long = "ansible-var", value_name = "KEY=VALUE", parse(try_from_str = parse_key_value))]
    pub ansible_vars: Vec<(String, String)>,
    /// Generate a Terraform module cloning the template
    #[clap(long, value_name = "NAME")]
    pub terraform_module: Option<String>,
    /// Variable written to the generated tfvars files, repeatable
    #[clap(long = "terraform-var", value_name = "KEY=VALUE", parse(try_from_str = parse_key_value))]
    pub terraform_vars: Vec<(String, String)>,
    /// Run terraform init and plan on the generated module
    #[clap(long)]
    pub terraform_plan: bool,
    /// Apply the generated module after planning
    #[clap(long)]
    pub terraform_apply: bool,
    /// Environment planned and applied, the first configured one by default
    #[clap(long, value_name = "ENV")]
    pub terraform_env: Option<String>,
    /// Build every template of a batch queue file
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub batch: Option<PathBuf>,
    /// Print the commands instead of running them
    #[clap(long)]
    pub dry_run: bool,
    /// Template configuration file, overridden by explicit flags
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Write the resolved configuration to FILE and exit
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub export_config: Option<PathBuf>,
    /// Toolkit settings file
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    pub settings: Option<PathBuf>,
    /// Keep a half-built VM when the build fails
    #[clap(long)]
    pub keep_on_failure: bool,
    /// Leave workload sandbox containers running
    #[clap(long)]
    pub keep_sandbox: bool,
    /// Never start the interactive menu
    #[clap(long)]
    pub non_interactive: bool,
    /// List the available distributions and exit
    #[clap(long)]
    pub list_distributions: bool,
    /// Enable debug logging
    #[clap(long)]
    pub debug: bool,
    /// Print a shell completion script and exit
    #[clap(long, arg_enum, value_name = "SHELL")]
    pub completion: Option<Shell>,
}

impl Cli {
    /// Whether any flag describes a template to build.
    pub fn has_template_params(&self) -> bool {
        self.distribution.is_some()
            || self.template_name.is_some()
            || self.vmid.is_some()
            || self.packages.is_some()
            || self.docker_template.is_some()
            || self.k8s_template.is_some()
            || self.ansible_playbook.is_some()
            || self.terraform_module.is_some()
            || self.config.is_some()
            || self.batch.is_some()
    }

    pub fn is_interactive(&self) -> bool {
        !self.non_interactive
            && !self.has_template_params()
            && termion::is_tty(&io::stdin())
            && termion::is_tty(&io::stdout())
    }

    pub fn options(&self) -> Options {
        Options {
            dry_run: self.dry_run,
            keep_on_failure: self.keep_on_failure,
            keep_sandbox: self.keep_sandbox,
            terraform_plan: self.terraform_plan,
            terraform_apply: self.terraform_apply,
            terraform_env: self.terraform_env.to_owned(),
        }
    }

    /// Settings defaults, then the `--config` file, then explicit flags.
    pub fn template_config(&self, settings: &Settings) -> Result<TemplateConfig> {
        let mut config = TemplateConfig {
            storage: settings.default_storage.to_owned(),
            bridge: settings.default_bridge.to_owned(),
            ..Default::default()
        };
        if let Some(path) = &self.config {
            let conf = ConfFile::load(path)?;
            config.apply_conf(&conf)?;
        }

        if let Some(distribution) = &self.distribution {
            config.distribution = distribution.to_owned();
        }
        if let Some(name) = &self.template_name {
            config.template_name = name.to_owned();
        }
        if self.vmid.is_some() {
            config.vmid = self.vmid;
        }
        if let Some(cores) = self.cores {
            config.cores = cores;
        }
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if let Some(disk_size) = &self.disk_size {
            config.disk_size = disk_size.to_owned();
        }
        if let Some(storage) = &self.storage {
            config.storage = storage.to_owned();
        }
        if let Some(bridge) = &self.bridge {
            config.bridge = bridge.to_owned();
        }
        if self.ssh_key.is_some() {
            config.ssh_key_file = self.ssh_key.to_owned();
        }
        if let Some(packages) = &self.packages {
            config.packages = split_list(packages);
        }
        if self.docker_template.is_some() {
            config.docker_template = self.docker_template.to_owned();
        }
        if self.k8s_template.is_some() {
            config.k8s_template = self.k8s_template.to_owned();
        }
        if self.ansible_playbook.is_some() {
            config.ansible_playbook = self.ansible_playbook.to_owned();
        }
        config
            .ansible_vars
            .extend(self.ansible_vars.iter().cloned());
        if self.terraform_module.is_some() {
            config.terraform_module = self.terraform_module.to_owned();
        }
        config
            .terraform_vars
            .extend(self.terraform_vars.iter().cloned());
        Ok(config)
    }
}
