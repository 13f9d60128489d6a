use std::{
    fmt::{self, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use iac::{Ansible, AnsibleFiles, Terraform, TerraformModule};
use indenter::indented;
use provisioner::{Provisioner, Workload, WorkloadReport};
use resources::{
    config::Settings,
    models::ToolkitError,
    objects::{DistributionRegistry, TemplateConfig, WorkloadCatalog},
};
use rpve::{
    deps::{self, Features},
    proxmox, BuiltTemplate, Cleanup, CommandRunner, DryRunRunner, RetryPolicy, SystemRunner,
    TemplateBuilder,
};

/// Behaviour switches taken from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    pub dry_run: bool,
    pub keep_on_failure: bool,
    pub keep_sandbox: bool,
    pub terraform_plan: bool,
    pub terraform_apply: bool,
    pub terraform_env: Option<String>,
}

/// Everything produced for one template.
#[derive(Debug, Clone)]
pub struct Created {
    pub template: BuiltTemplate,
    pub workloads: Vec<WorkloadReport>,
    pub terraform: Option<PathBuf>,
    pub ansible: Option<AnsibleFiles>,
}

impl fmt::Display for Created {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<16} {}", "Template:", self.template)?;
        for report in &self.workloads {
            write!(indented(f), "{}", report)?;
        }
        if let Some(dir) = &self.terraform {
            writeln!(f, "{:<16} {}", "Terraform:", dir.display())?;
        }
        if let Some(files) = &self.ansible {
            writeln!(f, "Ansible:")?;
            writeln!(indented(f), "{:<12} {}", "Inventory:", files.inventory.display())?;
            writeln!(indented(f), "{:<12} {}", "Playbook:", files.playbook.display())?;
        }
        Ok(())
    }
}

pub struct App {
    settings: Settings,
    registry: DistributionRegistry,
    catalog: WorkloadCatalog,
    runner: Arc<dyn CommandRunner>,
    cleanup: Cleanup,
    options: Options,
}

impl App {
    pub fn new(settings: Settings, options: Options) -> Result<Self> {
        let registry = DistributionRegistry::load(settings.distributions_file.as_deref())?;
        let catalog = WorkloadCatalog::load(&settings.workloads_dir)?;
        let runner: Arc<dyn CommandRunner> = if options.dry_run {
            Arc::new(DryRunRunner)
        } else {
            let timeout = match settings.command_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
            Arc::new(SystemRunner::new(timeout))
        };
        Ok(Self::with_runner(settings, registry, catalog, runner, options))
    }

    pub fn with_runner(
        settings: Settings,
        registry: DistributionRegistry,
        catalog: WorkloadCatalog,
        runner: Arc<dyn CommandRunner>,
        options: Options,
    ) -> Self {
        Self {
            settings,
            registry,
            catalog,
            runner,
            cleanup: Cleanup::new(),
            options,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &DistributionRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &WorkloadCatalog {
        &self.catalog
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.max_retry_attempts,
            Duration::from_secs(self.settings.retry_delay_secs),
        )
    }

    /// Binaries and privileges needed to build `config`.
    pub fn features(&self, config: &TemplateConfig) -> Result<Features> {
        let distro = self.registry.lookup(&config.distribution)?;
        Ok(Features {
            build_template: true,
            customize_image: !config.packages.is_empty(),
            decompress_image: distro.is_compressed(),
            sandbox: config.wants_workloads(),
            terraform_run: config.terraform_module.is_some()
                && (self.options.terraform_plan || self.options.terraform_apply),
            ansible_run: config.ansible_playbook.is_some(),
        })
    }

    /// Dependency and root checks, skipped in dry-run mode.
    pub async fn check_host(&self, features: &Features) -> Result<()> {
        if self.runner.is_dry_run() {
            return Ok(());
        }
        deps::check_dependencies(features)?;
        if features.needs_root() {
            deps::check_root(self.runner()).await?;
        }
        Ok(())
    }

    /// Build the template of `config` and everything it asks for on top.
    pub async fn create(&self, config: &TemplateConfig) -> Result<Created> {
        config.validate()?;
        let workloads = self.workloads(config)?;
        if config.terraform_module.is_some() {
            self.terraform_env()?;
        }
        self.check_host(&self.features(config)?).await?;
        self.check_storage(&config.storage).await?;

        let template = TemplateBuilder::new(
            self.runner(),
            &self.settings,
            &self.registry,
            self.cleanup.clone(),
        )
        .keep_on_failure(self.options.keep_on_failure)
        .build(config)
        .await?;

        let mut reports = vec![];
        for workload in &workloads {
            reports.push(self.provision(workload).await?);
        }
        let terraform = match config.terraform_module {
            Some(_) => Some(self.terraform(config, template.vmid).await?),
            None => None,
        };
        let ansible = if config.ansible_playbook.is_some() || !config.ansible_vars.is_empty() {
            Some(self.ansible(config, &template.ssh_user).await?)
        } else {
            None
        };
        Ok(Created {
            template,
            workloads: reports,
            terraform,
            ansible,
        })
    }

    /// Reject a target storage `pvesm` does not list for disk images.
    pub async fn check_storage(&self, storage: &str) -> Result<()> {
        let storages = proxmox::list_storage(self.runner(), "images").await?;
        if storages.is_empty() || storages.iter().any(|s| s.name == storage) {
            return Ok(());
        }
        let names = storages
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ToolkitError::invalid(format!(
            "storage '{}' cannot hold disk images, available: {}",
            storage, names
        ))
        .into())
    }

    /// Resolve the workload templates named in `config`.
    pub fn workloads(&self, config: &TemplateConfig) -> Result<Vec<Workload>> {
        let mut workloads = vec![];
        if let Some(name) = &config.docker_template {
            workloads.push(Workload::Docker(self.catalog.docker(name)?));
        }
        if let Some(name) = &config.k8s_template {
            workloads.push(Workload::Kubernetes(self.catalog.kubernetes(name)?));
        }
        Ok(workloads)
    }

    pub async fn provision(&self, workload: &Workload) -> Result<WorkloadReport> {
        self.check_host(&Features {
            sandbox: true,
            ..Default::default()
        })
        .await?;
        Provisioner::new(self.runner(), &self.settings, self.cleanup.clone())
            .keep_sandbox(self.options.keep_sandbox)
            .provision(workload)
            .await
    }

    fn terraform_env(&self) -> Result<String> {
        let environments = &self.settings.terraform.environments;
        match &self.options.terraform_env {
            Some(env) if environments.contains(env) => Ok(env.to_owned()),
            Some(env) => Err(ToolkitError::invalid(format!(
                "unknown Terraform environment '{}', expected one of {}",
                env,
                environments.join(", ")
            ))
            .into()),
            None => environments
                .first()
                .cloned()
                .ok_or_else(|| ToolkitError::invalid("no Terraform environments configured").into()),
        }
    }

    /// Write the Terraform module cloning `template_vmid`, planning and
    /// applying it when asked to.
    pub async fn terraform(&self, config: &TemplateConfig, template_vmid: u32) -> Result<PathBuf> {
        let module = TerraformModule::new(&self.settings.terraform, config, template_vmid)?;
        module.write(self.runner()).await?;
        tracing::info!("Terraform module {} at {}", module.name(), module.dir().display());
        if !(self.options.terraform_plan || self.options.terraform_apply) {
            return Ok(module.dir().to_owned());
        }

        let env = self.terraform_env()?;
        self.check_host(&Features {
            terraform_run: true,
            ..Default::default()
        })
        .await?;
        let terraform = Terraform::new(self.runner(), module.dir());
        terraform.init().await?;
        let plan = terraform.plan(&env).await?;
        if !plan.trim().is_empty() {
            println!("{}", plan.trim_end());
        }
        if self.options.terraform_apply {
            terraform.apply(&env).await?;
        }
        Ok(module.dir().to_owned())
    }

    /// Write the inventory and playbook, running the playbook when
    /// `config` names one.
    pub async fn ansible(&self, config: &TemplateConfig, ssh_user: &str) -> Result<AnsibleFiles> {
        let ansible = Ansible::new(self.runner(), &self.settings.ansible);
        let files = ansible
            .generate(config, &self.settings.terraform.endpoint, ssh_user)
            .await?;
        if config.ansible_playbook.is_some() {
            self.check_host(&Features {
                ansible_run: true,
                ..Default::default()
            })
            .await?;
            let output = ansible
                .run_playbook(&files.playbook, &config.ansible_vars)
                .await?;
            if !output.trim().is_empty() {
                println!("{}", output.trim_end());
            }
        }
        Ok(files)
    }

    /// Table of every known distribution.
    pub fn distribution_table(&self) -> String {
        let mut table = format!(
            "{: <24} {: <36} {: <8} {: <10}\n",
            "KEY", "NAME", "FAMILY", "RELEASE"
        );
        for distro in self.registry.iter() {
            writeln!(
                table,
                "{: <24} {: <36} {: <8} {: <10}",
                distro.key, distro.name, distro.family, distro.release
            )
            .ok();
        }
        table
    }

    /// Undo whatever interrupted operations left behind.
    pub async fn run_cleanup(&self) -> Result<()> {
        if self.cleanup.is_empty() {
            return Ok(());
        }
        tracing::warn!("Cleaning up {} pending resources...", self.cleanup.pending().len());
        self.cleanup
            .run(self.runner(), self.retry())
            .await
            .with_context(|| "Failed to clean up after interruption")
    }
}
