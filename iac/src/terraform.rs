use std::{
    collections::BTreeMap,
    fmt::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use resources::{config::TerraformSettings, models::ToolkitError, objects::TemplateConfig};
use rpve::{Cmd, CommandRunner};

const MAIN_TF: &str = r#"# Module MODULE_NAME, VMs cloned from template TEMPLATE_NAME (VMID TEMPLATE_VMID).
terraform {
  required_providers {
    proxmox = {
      source  = "bpg/proxmox"
      version = ">= 0.46.0"
    }
  }
}

provider "proxmox" {
  endpoint = var.proxmox_endpoint
  insecure = var.proxmox_insecure
}

resource "proxmox_virtual_environment_vm" "vm" {
  count     = var.vm_count
  name      = "${var.name_prefix}-${count.index + 1}"
  node_name = var.node_name
  tags      = var.tags

  clone {
    vm_id = var.template_vmid
    full  = true
  }

  agent {
    enabled = true
  }

  cpu {
    cores = var.cores
  }

  memory {
    dedicated = var.memory
  }

  network_device {
    bridge = var.bridge
  }

  initialization {
    ip_config {
      ipv4 {
        address = "dhcp"
      }
    }
  }
}
"#;

const VARIABLES_TF: &str = r#"variable "proxmox_endpoint" {
  description = "Proxmox VE API endpoint"
  type        = string
  default     = PROVIDER_ENDPOINT
}

variable "proxmox_insecure" {
  description = "Skip TLS verification of the Proxmox API"
  type        = bool
  default     = true
}

variable "node_name" {
  description = "Node the VMs are created on"
  type        = string
  default     = NODE_NAME
}

variable "template_vmid" {
  description = "VMID of the template to clone"
  type        = number
  default     = TEMPLATE_VMID
}

variable "name_prefix" {
  description = "VM names are <name_prefix>-<n>"
  type        = string
  default     = NAME_PREFIX
}

variable "vm_count" {
  type    = number
  default = 1
}

variable "cores" {
  type    = number
  default = DEFAULT_CORES
}

variable "memory" {
  description = "In MiB"
  type        = number
  default     = DEFAULT_MEMORY
}

variable "bridge" {
  type    = string
  default = DEFAULT_BRIDGE
}

variable "tags" {
  type    = list(string)
  default = DEFAULT_TAGS
}
EXTRA_VARIABLES"#;

const EXTRA_VARIABLE: &str = r#"
variable "VARIABLE_NAME" {
  description = "Custom variable"
}
"#;

const OUTPUTS_TF: &str = r#"output "vm_ids" {
  value = proxmox_virtual_environment_vm.vm[*].vm_id
}

output "vm_names" {
  value = proxmox_virtual_environment_vm.vm[*].name
}

output "ipv4_addresses" {
  value = proxmox_virtual_environment_vm.vm[*].ipv4_addresses
}
"#;

/// Variables declared by `variables.tf` itself.
const KNOWN_VARIABLES: &[&str] = &[
    "proxmox_endpoint",
    "proxmox_insecure",
    "node_name",
    "template_vmid",
    "name_prefix",
    "vm_count",
    "cores",
    "memory",
    "bridge",
    "tags",
];

/// Quote `value` as an HCL string literal.
pub fn hcl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // template sequences
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            },
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `-12`, `3` or `0.5`, nothing HCL would read differently.
fn is_plain_number(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    all_digits(whole) && fraction.map_or(true, all_digits)
}

/// Numbers and booleans stay bare, everything else becomes a string.
fn hcl_value(value: &str) -> String {
    if is_plain_number(value) || value == "true" || value == "false" {
        value.to_owned()
    } else {
        hcl_string(value)
    }
}

fn validate_identifier(name: &str, what: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ToolkitError::invalid(format!("invalid {} '{}'", what, name)).into())
    }
}

/// A Terraform module cloning VMs from one template.
#[derive(Debug, Clone, PartialEq)]
pub struct TerraformModule {
    name: String,
    dir: PathBuf,
    template_name: String,
    template_vmid: u32,
    cores: u32,
    memory: u32,
    bridge: String,
    tags: Vec<String>,
    endpoint: String,
    node: String,
    environments: Vec<String>,
    vars: BTreeMap<String, String>,
}

impl TerraformModule {
    pub fn new(settings: &TerraformSettings, config: &TemplateConfig, template_vmid: u32) -> Result<Self> {
        let name = config
            .terraform_module
            .to_owned()
            .unwrap_or_else(|| config.template_name.to_owned());
        validate_identifier(&name, "terraform module name")?;
        for key in config.terraform_vars.keys() {
            validate_identifier(key, "terraform variable")?;
        }
        for env in &settings.environments {
            validate_identifier(env, "terraform environment")?;
        }
        Ok(Self {
            dir: settings.output_dir.join(&name),
            name,
            template_name: config.template_name.to_owned(),
            template_vmid,
            cores: config.cores,
            memory: config.memory,
            bridge: config.bridge.to_owned(),
            tags: config.tags.to_owned(),
            endpoint: settings.endpoint.to_owned(),
            node: settings.node.to_owned(),
            environments: settings.environments.to_owned(),
            vars: config.terraform_vars.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn environments(&self) -> &[String] {
        &self.environments
    }

    pub fn main_tf(&self) -> String {
        MAIN_TF
            .replace("MODULE_NAME", &self.name)
            .replace("TEMPLATE_NAME", &self.template_name)
            .replace("TEMPLATE_VMID", &self.template_vmid.to_string())
    }

    pub fn variables_tf(&self) -> String {
        let tags = self
            .tags
            .iter()
            .map(|tag| hcl_string(tag))
            .collect::<Vec<_>>()
            .join(", ");
        let extra = self
            .vars
            .keys()
            .filter(|key| !KNOWN_VARIABLES.contains(&key.as_str()))
            .fold(String::new(), |acc, key| {
                acc + EXTRA_VARIABLE.replace("VARIABLE_NAME", key).as_str()
            });
        VARIABLES_TF
            .replace("PROVIDER_ENDPOINT", &hcl_string(&self.endpoint))
            .replace("NODE_NAME", &hcl_string(&self.node))
            .replace("TEMPLATE_VMID", &self.template_vmid.to_string())
            .replace("NAME_PREFIX", &hcl_string(&self.template_name))
            .replace("DEFAULT_CORES", &self.cores.to_string())
            .replace("DEFAULT_MEMORY", &self.memory.to_string())
            .replace("DEFAULT_BRIDGE", &hcl_string(&self.bridge))
            .replace("DEFAULT_TAGS", &format!("[{}]", tags))
            .replace("EXTRA_VARIABLES", &extra)
    }

    pub fn outputs_tf(&self) -> String {
        OUTPUTS_TF.to_string()
    }

    pub fn tfvars(&self, env: &str) -> String {
        let mut out = format!("# {} environment of {}\n", env, self.name);
        if !self.vars.contains_key("name_prefix") {
            writeln!(
                out,
                "name_prefix = {}",
                hcl_string(&format!("{}-{}", self.template_name, env))
            )
            .ok();
        }
        for (key, value) in &self.vars {
            writeln!(out, "{} = {}", key, hcl_value(value)).ok();
        }
        out
    }

    /// Module files, relative to [`dir`](Self::dir).
    pub fn files(&self) -> Vec<(PathBuf, String)> {
        let mut files = vec![
            (PathBuf::from("main.tf"), self.main_tf()),
            (PathBuf::from("variables.tf"), self.variables_tf()),
            (PathBuf::from("outputs.tf"), self.outputs_tf()),
        ];
        for env in &self.environments {
            files.push((tfvars_path(env), self.tfvars(env)));
        }
        files
    }

    pub async fn write(&self, runner: &dyn CommandRunner) -> Result<Vec<PathBuf>> {
        tracing::info!("Generating terraform module {} in {}...", self.name, self.dir.display());
        let mut written = vec![];
        for (relative, content) in self.files() {
            let path = self.dir.join(relative);
            if runner.is_dry_run() {
                tracing::info!("[dry-run] would write {}", path.display());
            } else {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            written.push(path);
        }
        Ok(written)
    }
}

fn tfvars_path(env: &str) -> PathBuf {
    Path::new("environments").join(format!("{}.tfvars", env))
}

/// `terraform` invocations inside a module directory.
pub struct Terraform<'a> {
    runner: &'a dyn CommandRunner,
    dir: PathBuf,
}

impl<'a> Terraform<'a> {
    pub fn new(runner: &'a dyn CommandRunner, dir: &Path) -> Self {
        Self {
            runner,
            dir: dir.to_owned(),
        }
    }

    fn terraform(&self, subcommand: &str) -> Cmd {
        Cmd::new("terraform")
            .arg(subcommand)
            .arg("-input=false")
            .current_dir(&self.dir)
    }

    pub async fn init(&self) -> Result<()> {
        tracing::info!("Running terraform init in {}...", self.dir.display());
        self.runner
            .check(&self.terraform("init"))
            .await
            .with_context(|| "terraform init failed")?;
        Ok(())
    }

    pub async fn plan(&self, env: &str) -> Result<String> {
        tracing::info!("Planning environment {}...", env);
        let output = self
            .runner
            .check(
                &self
                    .terraform("plan")
                    .arg(format!("-var-file={}", tfvars_path(env).display()))
                    .arg(format!("-out={}.tfplan", env)),
            )
            .await
            .with_context(|| format!("terraform plan failed for {}", env))?;
        Ok(output.stdout)
    }

    pub async fn apply(&self, env: &str) -> Result<()> {
        tracing::info!("Applying environment {}...", env);
        self.runner
            .check(
                &self
                    .terraform("apply")
                    .arg("-auto-approve")
                    .arg(format!("{}.tfplan", env)),
            )
            .await
            .with_context(|| format!("terraform apply failed for {}", env))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use resources::models::{exit_code_of, ExitCode};
    use rpve::{DryRunRunner, RecordingRunner};

    use super::*;

    fn config() -> TemplateConfig {
        let mut config = TemplateConfig {
            distribution: "debian-12".to_string(),
            template_name: "debian-base".to_string(),
            tags: vec!["linux".to_string(), "debian".to_string()],
            ..Default::default()
        };
        config
            .terraform_vars
            .insert("vm_count".to_string(), "3".to_string());
        config
            .terraform_vars
            .insert("owner".to_string(), "ops \"team\" ${x}".to_string());
        config
    }

    fn balanced(text: &str) -> bool {
        let mut depth = 0i32;
        for c in text.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {},
            }
            if depth < 0 {
                return false;
            }
        }
        depth == 0
    }

    #[test]
    fn escapes_hcl_strings() {
        assert_eq!(hcl_string("plain"), "\"plain\"");
        assert_eq!(hcl_string("a \"b\" \\ c"), "\"a \\\"b\\\" \\\\ c\"");
        assert_eq!(hcl_string("${var} %{if}"), "\"$${var} %%{if}\"");
        assert_eq!(hcl_string("cost $5"), "\"cost $5\"");
        assert_eq!(hcl_value("42"), "42");
        assert_eq!(hcl_value("true"), "true");
        assert_eq!(hcl_value("abc"), "\"abc\"");
        assert_eq!(hcl_value("inf"), "\"inf\"");
        assert_eq!(hcl_value("-3"), "-3");
        assert_eq!(hcl_value("0.25"), "0.25");
        for odd in ["+5", ".5", "5.", "NaN", "1e3", "-", ""] {
            assert_eq!(hcl_value(odd), hcl_string(odd), "{}", odd);
        }
    }

    #[test]
    fn user_name_prefix_replaces_default() {
        let mut config = config();
        config
            .terraform_vars
            .insert("name_prefix".to_string(), "web".to_string());
        let module = TerraformModule::new(&TerraformSettings::default(), &config, 9000).unwrap();
        let dev = module.tfvars("dev");
        assert_eq!(dev.matches("name_prefix =").count(), 1);
        assert!(dev.contains("name_prefix = \"web\""));
        assert_eq!(module.variables_tf().matches("variable \"name_prefix\"").count(), 1);
    }

    #[test]
    fn generated_files_are_well_formed() {
        let settings = TerraformSettings::default();
        let module = TerraformModule::new(&settings, &config(), 9000).unwrap();
        assert_eq!(module.dir(), settings.output_dir.join("debian-base"));

        let files = module.files();
        assert_eq!(files.len(), 3 + settings.environments.len());
        for (path, content) in &files {
            assert!(balanced(content), "{} is unbalanced", path.display());
        }

        let main = module.main_tf();
        assert!(main.contains("source  = \"bpg/proxmox\""));
        assert!(main.contains("VMID 9000"));
        assert!(main.contains("${var.name_prefix}-${count.index + 1}"));

        let variables = module.variables_tf();
        assert!(variables.contains("default     = 9000"));
        assert!(variables.contains("default = [\"linux\", \"debian\"]"));
        assert!(variables.contains("variable \"owner\""));
        assert_eq!(variables.matches("variable \"vm_count\"").count(), 1);

        let prod = module.tfvars("prod");
        assert!(prod.contains("name_prefix = \"debian-base-prod\""));
        assert!(prod.contains("vm_count = 3"));
        assert!(prod.contains("owner = \"ops \\\"team\\\" $${x}\""));
    }

    #[test]
    fn rejects_bad_identifiers() {
        let mut config = config();
        config
            .terraform_vars
            .insert("bad key".to_string(), "1".to_string());
        let err = TerraformModule::new(&TerraformSettings::default(), &config, 9000).unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
    }

    #[tokio::test]
    async fn writes_module_tree() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TerraformSettings {
            output_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let mut config = config();
        config.terraform_module = Some("web".to_string());
        let module = TerraformModule::new(&settings, &config, 9000).unwrap();

        let written = module.write(&RecordingRunner::new()).await.unwrap();
        assert_eq!(written.len(), 6);
        assert!(dir.path().join("web/main.tf").is_file());
        assert!(dir.path().join("web/environments/staging.tfvars").is_file());

        let dry = TerraformModule::new(
            &TerraformSettings {
                output_dir: dir.path().join("dry"),
                ..Default::default()
            },
            &config,
            9000,
        )
        .unwrap();
        dry.write(&DryRunRunner).await.unwrap();
        assert!(!dir.path().join("dry").exists());
    }

    #[tokio::test]
    async fn runs_terraform_in_module_dir() {
        let runner = RecordingRunner::new();
        let terraform = Terraform::new(&runner, Path::new("/opt/terraform/modules/web"));
        terraform.init().await.unwrap();
        terraform.plan("dev").await.unwrap();
        terraform.apply("dev").await.unwrap();

        assert_eq!(
            runner.lines(),
            vec![
                "terraform init -input=false",
                "terraform plan -input=false -var-file=environments/dev.tfvars -out=dev.tfplan",
                "terraform apply -input=false -auto-approve dev.tfplan",
            ]
        );
    }
}
