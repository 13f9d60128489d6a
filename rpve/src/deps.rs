//! Host dependency and permission checks.

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use resources::models::ToolkitError;

use crate::exec::{Cmd, CommandRunner};

/// What the current invocation is going to do, deciding which binaries it needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub build_template: bool,
    pub customize_image: bool,
    pub decompress_image: bool,
    pub sandbox: bool,
    pub terraform_run: bool,
    pub ansible_run: bool,
}

impl Features {
    pub fn required_binaries(&self) -> Vec<&'static str> {
        let mut binaries = vec![];
        if self.build_template {
            binaries.extend(["qm", "pvesm"]);
        }
        if self.customize_image {
            binaries.push("virt-customize");
        }
        if self.decompress_image {
            binaries.push("xz");
        }
        if self.sandbox {
            binaries.push("pct");
        }
        if self.terraform_run {
            binaries.push("terraform");
        }
        if self.ansible_run {
            binaries.push("ansible-playbook");
        }
        binaries.dedup();
        binaries
    }

    /// Whether anything touches Proxmox and therefore needs root.
    pub fn needs_root(&self) -> bool {
        self.build_template || self.sandbox
    }
}

/// Locate an executable on `PATH`.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_in(binary, env::split_paths(&path))
}

fn find_in(binary: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn check_dependencies(features: &Features) -> Result<()> {
    let missing = features
        .required_binaries()
        .into_iter()
        .filter(|binary| find_in_path(binary).is_none())
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ToolkitError::MissingDependencies(missing).into())
}

/// Fail unless running with effective uid 0.
pub async fn check_root(runner: &dyn CommandRunner) -> Result<()> {
    let output = runner
        .check(&Cmd::new("id").arg("-u").query())
        .await
        .with_context(|| "Failed to determine the current user")?;
    match output.stdout.trim() {
        "0" => Ok(()),
        uid => Err(ToolkitError::InsufficientPermissions(format!(
            "must run as root, current uid is {}",
            uid
        ))
        .into()),
    }
}
