//! Turning a [`TemplateConfig`] into a Proxmox VM template.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use resources::{
    config::Settings,
    models::ToolkitError,
    objects::{Bios, Distribution, DistributionRegistry, TemplateConfig},
};

use crate::{
    cleanup::{Cleanup, CleanupAction, CleanupHandle},
    cloud_init::SnippetStore,
    exec::{Cmd, CommandRunner},
    image::ImageCache,
    proxmox::Vm,
    vmid::VmidAllocator,
};

const BOOT_DISK: &str = "scsi0";

/// A finished template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTemplate {
    pub vmid: u32,
    pub name: String,
    pub distribution: String,
    /// Login user configured through cloud-init.
    pub ssh_user: String,
}

impl std::fmt::Display for BuiltTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (VMID {}, {}, user {})",
            self.name, self.vmid, self.distribution, self.ssh_user
        )
    }
}

pub struct TemplateBuilder<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    registry: &'a DistributionRegistry,
    cleanup: Cleanup,
    keep_on_failure: bool,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        settings: &'a Settings,
        registry: &'a DistributionRegistry,
        cleanup: Cleanup,
    ) -> Self {
        Self {
            runner,
            settings,
            registry,
            cleanup,
            keep_on_failure: false,
        }
    }

    /// Keep a half-built VM for inspection instead of destroying it.
    pub fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = keep;
        self
    }

    pub async fn build(&self, config: &TemplateConfig) -> Result<BuiltTemplate> {
        config.validate()?;
        let distro = self.registry.lookup(&config.distribution)?;
        if let Some(key) = &config.ssh_key_file {
            if !key.is_file() {
                return Err(ToolkitError::invalid(format!(
                    "SSH key file {} does not exist",
                    key.display()
                ))
                .into());
            }
        }
        tracing::info!(
            "Creating template {} from {}...",
            config.template_name,
            distro.name
        );

        let work_dir = self
            .settings
            .work_dir
            .join(format!("{}-{}", config.template_name, std::process::id()));
        let work_handle = self
            .cleanup
            .register(CleanupAction::RemoveDir(work_dir.to_owned()));
        let result = self.build_in(config, distro, &work_dir).await;
        if let Err(err) = self.cleanup.run_one(self.runner, work_handle).await {
            tracing::warn!("Failed to remove work directory: {:#}", err);
        }
        result
    }

    async fn build_in(
        &self,
        config: &TemplateConfig,
        distro: &Distribution,
        work_dir: &Path,
    ) -> Result<BuiltTemplate> {
        let image = ImageCache::new(&self.settings.image_cache_dir)
            .fetch(self.runner, distro)
            .await
            .with_context(|| format!("Failed to fetch image of {}", distro.key))?;
        let image = self.customize(config, &image, work_dir).await?;

        let mut allocator = VmidAllocator::from_settings(self.settings);
        if self.runner.is_dry_run() {
            allocator = allocator.without_lock();
        }
        let reservation = allocator.reserve(self.runner, config.vmid).await?;
        let vm = Vm::new(reservation.vmid());
        tracing::info!("Creating VM {}...", vm.vmid());
        vm.create(self.runner, &create_options(config, distro))
            .await?;
        let vm_handle = self.cleanup.register(CleanupAction::DestroyVm(vm.vmid()));
        reservation.release();

        match self.configure(&vm, config, distro, &image).await {
            Ok(()) => {
                self.cleanup.disarm(vm_handle);
                let built = BuiltTemplate {
                    vmid: vm.vmid(),
                    name: config.template_name.to_owned(),
                    distribution: distro.key.to_owned(),
                    ssh_user: ssh_user(config, distro),
                };
                tracing::info!("Template {} created", built);
                Ok(built)
            },
            Err(err) => {
                self.roll_back(vm_handle, vm.vmid()).await;
                Err(err)
            },
        }
    }

    async fn roll_back(&self, handle: CleanupHandle, vmid: u32) {
        if self.keep_on_failure {
            self.cleanup.disarm(handle);
            tracing::warn!("Keeping partially created VM {} for inspection", vmid);
            return;
        }
        tracing::warn!("Destroying partially created VM {}...", vmid);
        if let Err(err) = self.cleanup.run_one(self.runner, handle).await {
            tracing::error!("Failed to destroy VM {}: {:#}", vmid, err);
        }
    }

    /// Bake packages into a working copy of the image.
    async fn customize(&self, config: &TemplateConfig, image: &Path, work_dir: &Path) -> Result<PathBuf> {
        if config.packages.is_empty() {
            return Ok(image.to_owned());
        }
        let file_name = image
            .file_name()
            .with_context(|| format!("Invalid image path {}", image.display()))?;
        let copy = work_dir.join(file_name);
        if !self.runner.is_dry_run() {
            tokio::fs::create_dir_all(work_dir)
                .await
                .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;
            tokio::fs::copy(image, &copy)
                .await
                .with_context(|| format!("Failed to copy {} to {}", image.display(), copy.display()))?;
        }
        tracing::info!("Installing {} into the image...", config.packages.join(" "));
        self.runner
            .check(
                &Cmd::new("virt-customize")
                    .opt("-a", copy.display().to_string())
                    .opt("--install", config.packages.join(","))
                    .opt("--run-command", "truncate -s 0 /etc/machine-id"),
            )
            .await
            .with_context(|| "Failed to customize image")?;
        Ok(copy)
    }

    async fn configure(
        &self,
        vm: &Vm,
        config: &TemplateConfig,
        distro: &Distribution,
        image: &Path,
    ) -> Result<()> {
        tracing::info!("Importing disk into VM {}...", vm.vmid());
        let volume = vm
            .import_disk(self.runner, &image.display().to_string(), &config.storage)
            .await?;
        let mut disks = options(&[
            ("--scsi0", format!("{},discard=on", volume)),
            ("--boot", format!("order={}", BOOT_DISK)),
        ]);
        if distro.cloud_init {
            disks.push(("--ide2".to_string(), format!("{}:cloudinit", config.storage)));
        }
        vm.set(self.runner, &disks).await?;

        tracing::info!("Resizing disk to {}...", config.disk_size);
        vm.resize(self.runner, BOOT_DISK, &config.disk_size)
            .await?;

        if distro.cloud_init {
            tracing::info!("Configuring cloud-init...");
            let snippets = SnippetStore::new(
                &self.settings.snippets_storage,
                &self.settings.snippets_dir,
            )
            .timezone(&self.settings.timezone);
            let snippet = snippets
                .write_vendor_data(self.runner, vm.vmid(), distro)
                .await?;
            let mut cloud_init = options(&[
                ("--ciuser", ssh_user(config, distro)),
                ("--ipconfig0", config.ip_config.to_owned()),
            ]);
            if let Some(password) = &config.ci_password {
                cloud_init.push(("--cipassword".to_string(), password.to_owned()));
            }
            if let Some(key) = &config.ssh_key_file {
                cloud_init.push(("--sshkeys".to_string(), key.display().to_string()));
            }
            if let Some(nameserver) = &config.nameserver {
                cloud_init.push(("--nameserver".to_string(), nameserver.to_owned()));
            }
            if let Some(snippet) = snippet {
                cloud_init.push(("--cicustom".to_string(), snippet.cicustom()));
            }
            vm.set(self.runner, &cloud_init).await?;
        }

        tracing::info!("Converting VM {} to a template...", vm.vmid());
        vm.convert_to_template(self.runner).await
    }
}

fn options(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(flag, value)| (flag.to_string(), value.to_owned()))
        .collect()
}

fn ssh_user(config: &TemplateConfig, distro: &Distribution) -> String {
    config
        .ci_user
        .to_owned()
        .unwrap_or_else(|| distro.default_user.to_owned())
}

fn create_options(config: &TemplateConfig, distro: &Distribution) -> Vec<(String, String)> {
    let mut create = options(&[
        ("--name", config.template_name.to_owned()),
        ("--memory", config.memory.to_string()),
        ("--cores", config.cores.to_string()),
        ("--cpu", config.cpu_type.to_owned()),
        ("--machine", config.machine.to_owned()),
        ("--bios", config.bios.to_string()),
        ("--net0", config.net0()),
        ("--scsihw", "virtio-scsi-pci".to_string()),
        ("--agent", "enabled=1".to_string()),
        ("--ostype", "l26".to_string()),
        ("--serial0", "socket".to_string()),
        ("--vga", "serial0".to_string()),
        (
            "--description",
            format!("{} cloud image template", distro.name),
        ),
    ]);
    if !config.tags.is_empty() {
        create.push(("--tags".to_string(), config.tags.join(";")));
    }
    if config.bios == Bios::Ovmf {
        create.push((
            "--efidisk0".to_string(),
            format!("{}:1,efitype=4m", config.storage),
        ));
    }
    create
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use resources::models::{exit_code_of, ExitCode};

    use super::*;
    use crate::exec::{DryRunRunner, Output, RecordingRunner};

    struct Fixture {
        dir: tempfile::TempDir,
        settings: Settings,
        registry: DistributionRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("test.qcow2");
        std::fs::write(&image, b"disk").unwrap();
        let distributions = dir.path().join("distributions.yaml");
        let mut file = std::fs::File::create(&distributions).unwrap();
        write!(
            file,
            "- key: test-os\n  name: Test OS\n  family: debian\n  release: \"1\"\n  url: file://{}\n  default_user: tester\n",
            image.display()
        )
        .unwrap();
        let settings = Settings {
            work_dir: dir.path().join("work"),
            image_cache_dir: dir.path().join("images"),
            snippets_dir: dir.path().join("snippets"),
            vmid_lock_file: dir.path().join("vmid.lock"),
            ..Default::default()
        };
        let registry = DistributionRegistry::load(Some(&distributions)).unwrap();
        Fixture {
            dir,
            settings,
            registry,
        }
    }

    fn config() -> TemplateConfig {
        TemplateConfig {
            distribution: "test-os".to_string(),
            template_name: "test-template".to_string(),
            packages: vec!["htop".to_string(), "curl".to_string()],
            tags: vec!["linux".to_string(), "test".to_string()],
            ..Default::default()
        }
    }

    fn free_vmid_1000() -> RecordingRunner {
        let runner = RecordingRunner::new();
        runner
            .respond_once("qm status 1000", Output::failed(2, "does not exist"))
            .respond_once("pct status 1000", Output::failed(2, "does not exist"));
        runner
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let f = fixture();
        let runner = free_vmid_1000();
        let cleanup = Cleanup::new();
        let built = TemplateBuilder::new(&runner, &f.settings, &f.registry, cleanup.clone())
            .build(&config())
            .await
            .unwrap();
        assert_eq!(built.vmid, 1000);
        assert_eq!(built.ssh_user, "tester");
        assert!(cleanup.is_empty());

        let order = [
            "virt-customize -a",
            "qm create 1000",
            "qm importdisk 1000",
            "qm set 1000 --scsi0",
            "qm resize 1000 scsi0 20G",
            "qm set 1000 --ciuser tester",
            "qm template 1000",
        ]
        .iter()
        .map(|prefix| runner.position(prefix).unwrap())
        .collect::<Vec<_>>();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", runner.lines());

        let lines = runner.lines();
        let create = &lines[runner.position("qm create").unwrap()];
        assert!(create.contains("--tags 'linux;test'"));
        assert!(create.contains("--net0 virtio,bridge=vmbr0"));
        assert!(!create.contains("--efidisk0"));
        let customize = &lines[runner.position("virt-customize").unwrap()];
        assert!(customize.contains("--install htop,curl"));
        let cloud_init = &lines[runner.position("qm set 1000 --ciuser").unwrap()];
        assert!(cloud_init.contains("--cicustom vendor=local:snippets/vendor-1000.yaml"));
        assert!(f.dir.path().join("snippets/vendor-1000.yaml").exists());
        assert!(!f.settings.work_dir.join(format!("test-template-{}", std::process::id())).exists());
        assert!(!f.settings.vmid_lock_file.exists());
    }

    #[tokio::test]
    async fn failure_after_create_destroys_vm() {
        let f = fixture();
        let runner = free_vmid_1000();
        runner.fail_on("qm resize");
        let cleanup = Cleanup::new();

        let err = TemplateBuilder::new(&runner, &f.settings, &f.registry, cleanup.clone())
            .build(&config())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("resize"));
        assert!(runner.position("qm destroy 1000 --purge").is_some());
        assert!(runner.position("qm template").is_none());
        assert!(cleanup.is_empty());
    }

    #[tokio::test]
    async fn keep_on_failure_leaves_vm() {
        let f = fixture();
        let runner = free_vmid_1000();
        runner.fail_on("qm template");
        let cleanup = Cleanup::new();

        TemplateBuilder::new(&runner, &f.settings, &f.registry, cleanup.clone())
            .keep_on_failure(true)
            .build(&config())
            .await
            .unwrap_err();
        assert!(runner.position("qm destroy").is_none());
        assert!(cleanup.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_runs_nothing() {
        let f = fixture();
        let runner = RecordingRunner::new();
        let mut config = config();
        config.template_name = "-bad-".to_string();

        let err = TemplateBuilder::new(&runner, &f.settings, &f.registry, Cleanup::new())
            .build(&config)
            .await
            .unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
        assert!(runner.lines().is_empty());

        config.template_name = "good".to_string();
        config.ssh_key_file = Some(f.dir.path().join("missing.pub"));
        let err = TemplateBuilder::new(&runner, &f.settings, &f.registry, Cleanup::new())
            .build(&config)
            .await
            .unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
    }

    #[tokio::test]
    async fn ovmf_gets_efi_disk_and_dry_run_touches_nothing() {
        let f = fixture();
        let mut config = config();
        config.bios = Bios::Ovmf;
        config.vmid = Some(9000);

        let built = TemplateBuilder::new(&DryRunRunner, &f.settings, &f.registry, Cleanup::new())
            .build(&config)
            .await
            .unwrap();
        assert_eq!(built.vmid, 9000);
        assert!(!f.dir.path().join("snippets").exists());
        assert!(!f.settings.work_dir.exists());

        let create = create_options(&config, f.registry.get("test-os").unwrap());
        assert!(create.contains(&("--efidisk0".to_string(), "local-lvm:1,efitype=4m".to_string())));
        assert!(create.contains(&("--bios".to_string(), "ovmf".to_string())));
    }
}
