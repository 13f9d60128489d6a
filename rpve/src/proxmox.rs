//! Thin wrappers over the `qm`, `pct` and `pvesm` command line tools.

use anyhow::{Context, Result};

use crate::exec::{Cmd, CommandRunner, Output};

/// A QEMU virtual machine, addressed by VMID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vm {
    vmid: u32,
}

impl Vm {
    pub fn new(vmid: u32) -> Self {
        Self {
            vmid,
        }
    }

    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    fn qm(&self, subcommand: &str) -> Cmd {
        Cmd::new("qm").arg(subcommand).arg(self.vmid.to_string())
    }

    /// `qm status` exits non-zero for unknown VMIDs.
    pub async fn exists(&self, runner: &dyn CommandRunner) -> Result<bool> {
        let output = runner.run(&self.qm("status").query()).await?;
        Ok(output.success())
    }

    /// Create the VM. `options` are `(flag, value)` pairs such as `("--memory", "2048")`.
    pub async fn create(&self, runner: &dyn CommandRunner, options: &[(String, String)]) -> Result<()> {
        let mut cmd = self.qm("create");
        for (flag, value) in options {
            cmd = cmd.opt(flag, value);
        }
        runner
            .check(&cmd)
            .await
            .with_context(|| format!("Failed to create VM {}", self.vmid))?;
        Ok(())
    }

    /// Import a disk image, returning the volume it was imported as.
    pub async fn import_disk(
        &self,
        runner: &dyn CommandRunner,
        image: &str,
        storage: &str,
    ) -> Result<String> {
        let output = runner
            .check(&self.qm("importdisk").arg(image).arg(storage))
            .await
            .with_context(|| format!("Failed to import disk {} into VM {}", image, self.vmid))?;
        Ok(imported_volume(&output).unwrap_or_else(|| {
            format!("{}:vm-{}-disk-0", storage, self.vmid)
        }))
    }

    pub async fn set(&self, runner: &dyn CommandRunner, options: &[(String, String)]) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }
        let mut cmd = self.qm("set");
        for (flag, value) in options {
            cmd = cmd.opt(flag, value);
        }
        runner
            .check(&cmd)
            .await
            .with_context(|| format!("Failed to configure VM {}", self.vmid))?;
        Ok(())
    }

    pub async fn resize(&self, runner: &dyn CommandRunner, disk: &str, size: &str) -> Result<()> {
        runner
            .check(&self.qm("resize").arg(disk).arg(size))
            .await
            .with_context(|| format!("Failed to resize {} of VM {}", disk, self.vmid))?;
        Ok(())
    }

    pub async fn convert_to_template(&self, runner: &dyn CommandRunner) -> Result<()> {
        runner
            .check(&self.qm("template"))
            .await
            .with_context(|| format!("Failed to convert VM {} to a template", self.vmid))?;
        Ok(())
    }

    /// Destroy the VM and its disks, return `false` if it did not exist.
    pub async fn destroy(&self, runner: &dyn CommandRunner) -> Result<bool> {
        if !runner.is_dry_run() && !self.exists(runner).await? {
            return Ok(false);
        }
        runner
            .check(&self.qm("destroy").arg("--purge"))
            .await
            .with_context(|| format!("Failed to destroy VM {}", self.vmid))?;
        Ok(true)
    }
}

/// `qm importdisk` reports e.g. `Successfully imported disk as 'unused0:local-lvm:vm-9000-disk-0'`.
fn imported_volume(output: &Output) -> Option<String> {
    output
        .stdout
        .lines()
        .filter_map(|line| line.split('\'').nth(1))
        .find_map(|quoted| {
            quoted
                .strip_prefix("unused")
                .and_then(|rest| rest.split_once(':'))
                .map(|(_, volume)| volume.to_owned())
        })
}

/// An LXC container, addressed by VMID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ct {
    vmid: u32,
}

impl Ct {
    pub fn new(vmid: u32) -> Self {
        Self {
            vmid,
        }
    }

    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    fn pct(&self, subcommand: &str) -> Cmd {
        Cmd::new("pct").arg(subcommand).arg(self.vmid.to_string())
    }

    pub async fn exists(&self, runner: &dyn CommandRunner) -> Result<bool> {
        let output = runner.run(&self.pct("status").query()).await?;
        Ok(output.success())
    }

    pub async fn create(
        &self,
        runner: &dyn CommandRunner,
        ostemplate: &str,
        options: &[(String, String)],
    ) -> Result<()> {
        let mut cmd = self.pct("create").arg(ostemplate);
        for (flag, value) in options {
            cmd = cmd.opt(flag, value);
        }
        runner
            .check(&cmd)
            .await
            .with_context(|| format!("Failed to create container {}", self.vmid))?;
        Ok(())
    }

    pub async fn start(&self, runner: &dyn CommandRunner) -> Result<()> {
        runner
            .check(&self.pct("start"))
            .await
            .with_context(|| format!("Failed to start container {}", self.vmid))?;
        Ok(())
    }

    pub async fn stop(&self, runner: &dyn CommandRunner) -> Result<()> {
        runner
            .check(&self.pct("stop"))
            .await
            .with_context(|| format!("Failed to stop container {}", self.vmid))?;
        Ok(())
    }

    /// Build a `pct exec <vmid> -- <args>` command without running it.
    pub fn exec_cmd<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pct("exec").arg("--").args(args)
    }

    /// Remove the container, return `true` if succeeded, `false` if not found.
    pub async fn destroy(&self, runner: &dyn CommandRunner) -> Result<bool> {
        if !runner.is_dry_run() && !self.exists(runner).await? {
            return Ok(false);
        }
        if let Err(err) = self.stop(runner).await {
            tracing::debug!("Stopping container before destroy: {:#}", err);
        }
        runner
            .check(&self.pct("destroy").arg("--purge"))
            .await
            .with_context(|| format!("Failed to destroy container {}", self.vmid))?;
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub name: String,
    pub kind: String,
    pub active: bool,
    /// In KiB
    pub total: u64,
    pub available: u64,
}

impl std::fmt::Display for StorageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {:.1} GiB free)",
            self.name,
            self.kind,
            self.available as f64 / (1024.0 * 1024.0)
        )
    }
}

/// List storages able to hold `content` (e.g. `images`, `rootdir`, `snippets`).
///
/// An empty list means the information is unavailable, not that no storage exists.
pub async fn list_storage(runner: &dyn CommandRunner, content: &str) -> Result<Vec<StorageInfo>> {
    let output = runner
        .run(&Cmd::new("pvesm").arg("status").opt("--content", content).query())
        .await?;
    if !output.success() {
        tracing::debug!("pvesm status failed: {}", output.stderr.trim());
        return Ok(vec![]);
    }
    Ok(parse_storage_table(&output.stdout))
}

fn parse_storage_table(table: &str) -> Vec<StorageInfo> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns = line.split_whitespace().collect::<Vec<_>>();
            if columns.len() < 6 {
                return None;
            }
            Some(StorageInfo {
                name: columns[0].to_owned(),
                kind: columns[1].to_owned(),
                active: columns[2] == "active",
                total: columns[3].parse().unwrap_or_default(),
                available: columns[5].parse().unwrap_or_default(),
            })
        })
        .collect()
}
