//! Disposable LXC containers used to provision and verify workloads.

use std::time::Duration;

use anyhow::{Context, Result};
use resources::{
    config::SandboxSettings,
    objects::{OsFamily, PackageManager},
};

use crate::{
    cleanup::{Cleanup, CleanupAction, CleanupHandle},
    exec::{CommandRunner, Output},
    proxmox::Ct,
    retry::RetryPolicy,
    vmid::VmidAllocator,
};

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NETWORK_PROBE: &str = "getent hosts deb.debian.org >/dev/null || ping -c 1 -W 2 1.1.1.1";

/// A running sandbox container. It is destroyed by [`Sandbox::destroy`] or,
/// if the process is interrupted, by the cleanup registry.
pub struct Sandbox<'a> {
    ct: Ct,
    runner: &'a dyn CommandRunner,
    cleanup: Cleanup,
    handle: Option<CleanupHandle>,
    package_manager: PackageManager,
}

impl<'a> Sandbox<'a> {
    pub async fn create(
        runner: &'a dyn CommandRunner,
        cleanup: &Cleanup,
        allocator: &VmidAllocator,
        settings: &SandboxSettings,
        hostname: &str,
    ) -> Result<Sandbox<'a>> {
        let reservation = allocator.reserve(runner, None).await?;
        let ct = Ct::new(reservation.vmid());
        tracing::info!("Creating sandbox container {} ({})...", ct.vmid(), hostname);
        ct.create(runner, &settings.ostemplate, &create_options(settings, hostname))
            .await?;
        let handle = cleanup.register(CleanupAction::DestroyContainer(ct.vmid()));
        reservation.release();

        let sandbox = Sandbox {
            ct,
            runner,
            cleanup: cleanup.clone(),
            handle: Some(handle),
            package_manager: package_manager_for(&settings.ostemplate),
        };
        let timeout = Duration::from_secs(settings.network_timeout_secs);
        if let Err(err) = sandbox.boot(timeout).await {
            if let Err(cleanup_err) = sandbox.cleanup.run_one(runner, handle).await {
                tracing::error!("Failed to remove sandbox {}: {:#}", ct.vmid(), cleanup_err);
            }
            return Err(err);
        }
        Ok(sandbox)
    }

    async fn boot(&self, network_timeout: Duration) -> Result<()> {
        self.ct.start(self.runner).await?;
        self.wait_for_network(network_timeout).await
    }

    pub fn vmid(&self) -> u32 {
        self.ct.vmid()
    }

    pub fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    pub fn package_manager(&self) -> PackageManager {
        self.package_manager
    }

    pub async fn wait_for_network(&self, timeout: Duration) -> Result<()> {
        if self.runner.is_dry_run() {
            return Ok(());
        }
        tracing::info!("Waiting for network in sandbox {}...", self.vmid());
        let attempts = (timeout.as_secs() / NETWORK_POLL_INTERVAL.as_secs()).max(1) as u32;
        RetryPolicy::new(attempts, NETWORK_POLL_INTERVAL)
            .run("Network check", || self.exec_shell(NETWORK_PROBE))
            .await
            .with_context(|| format!("Sandbox {} has no network", self.vmid()))?;
        Ok(())
    }

    /// Run a command inside the container, failing on a non-zero exit.
    pub async fn exec<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.check(&self.ct.exec_cmd(args)).await
    }

    pub async fn exec_shell(&self, script: &str) -> Result<Output> {
        self.exec(["sh", "-c", script]).await
    }

    pub async fn exec_with_stdin<I, S>(&self, args: I, stdin: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner
            .check(&self.ct.exec_cmd(args).stdin(stdin))
            .await
    }

    /// Like [`exec`](Self::exec), but a failing command is reported in the output.
    pub async fn probe<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&self.ct.exec_cmd(args).query()).await
    }

    pub async fn install_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "Installing {} in sandbox {}...",
            packages.join(" "),
            self.vmid()
        );
        if let Some(update) = self.package_manager.update_command() {
            self.exec(update).await?;
        }
        self.exec(self.package_manager.install_command(packages)?)
            .await
            .with_context(|| format!("Failed to install packages in sandbox {}", self.vmid()))?;
        Ok(())
    }

    pub async fn destroy(mut self) -> Result<()> {
        tracing::info!("Destroying sandbox {}...", self.vmid());
        match self.handle.take() {
            Some(handle) => self.cleanup.run_one(self.runner, handle).await,
            None => Ok(()),
        }
    }

    /// Leave the container running for inspection, returning its VMID.
    pub fn keep(mut self) -> u32 {
        if let Some(handle) = self.handle.take() {
            self.cleanup.disarm(handle);
        }
        tracing::info!("Keeping sandbox container {}", self.vmid());
        self.vmid()
    }
}

fn create_options(settings: &SandboxSettings, hostname: &str) -> Vec<(String, String)> {
    [
        ("--hostname", hostname.to_owned()),
        ("--cores", settings.cores.to_string()),
        ("--memory", settings.memory.to_string()),
        ("--rootfs", format!("{}:{}", settings.storage, settings.disk_gb)),
        ("--net0", format!("name=eth0,bridge={},ip=dhcp", settings.bridge)),
        ("--unprivileged", "1".to_string()),
        // docker and k3s both need nested namespaces
        ("--features", "nesting=1,keyctl=1".to_string()),
        ("--onboot", "0".to_string()),
    ]
    .into_iter()
    .map(|(flag, value)| (flag.to_string(), value))
    .collect()
}

/// Guess the package manager of an ostemplate from its file name.
fn package_manager_for(ostemplate: &str) -> PackageManager {
    let name = ostemplate
        .rsplit('/')
        .next()
        .unwrap_or(ostemplate)
        .to_ascii_lowercase();
    let family = if name.starts_with("debian") || name.starts_with("ubuntu") {
        OsFamily::Debian
    } else if ["fedora", "rocky", "almalinux", "centos"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        OsFamily::RedHat
    } else if name.starts_with("opensuse") {
        OsFamily::Suse
    } else if name.starts_with("archlinux") {
        OsFamily::Arch
    } else if name.starts_with("alpine") {
        OsFamily::Alpine
    } else {
        OsFamily::Other
    };
    family.package_manager()
}
