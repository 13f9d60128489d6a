use std::{collections::BTreeMap, fmt::Write, fs::File, path::Path};

use anyhow::{Context, Result};
use indenter::indented;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::models::ToolkitError;

const BUILTIN_DISTRIBUTIONS: &str = include_str!("../../data/distributions.yaml");

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
    EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OsFamily {
    Debian,
    RedHat,
    Suse,
    Arch,
    Alpine,
    Other,
}

impl OsFamily {
    pub fn package_manager(&self) -> PackageManager {
        match self {
            OsFamily::Debian => PackageManager::Apt,
            OsFamily::RedHat => PackageManager::Dnf,
            OsFamily::Suse => PackageManager::Zypper,
            OsFamily::Arch => PackageManager::Pacman,
            OsFamily::Alpine => PackageManager::Apk,
            OsFamily::Other => PackageManager::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Zypper,
    Pacman,
    Apk,
    Unknown,
}

impl PackageManager {
    /// Command refreshing the package index, `None` if the manager does not need one.
    pub fn update_command(&self) -> Option<Vec<String>> {
        let cmd: &[&str] = match self {
            PackageManager::Apt => &["apt-get", "update"],
            PackageManager::Dnf => &["dnf", "makecache"],
            PackageManager::Zypper => &["zypper", "--non-interactive", "refresh"],
            PackageManager::Pacman => &["pacman", "-Sy", "--noconfirm"],
            PackageManager::Apk => &["apk", "update"],
            PackageManager::Unknown => return None,
        };
        Some(cmd.iter().map(|s| s.to_string()).collect())
    }

    pub fn install_command(&self, packages: &[String]) -> Result<Vec<String>> {
        let prefix: &[&str] = match self {
            PackageManager::Apt => &[
                "env",
                "DEBIAN_FRONTEND=noninteractive",
                "apt-get",
                "install",
                "-y",
            ],
            PackageManager::Dnf => &["dnf", "install", "-y"],
            PackageManager::Zypper => &["zypper", "--non-interactive", "install"],
            PackageManager::Pacman => &["pacman", "-S", "--noconfirm", "--needed"],
            PackageManager::Apk => &["apk", "add", "--no-cache"],
            PackageManager::Unknown => {
                anyhow::bail!("No known package manager, cannot install {}", packages.join(" "))
            },
        };
        Ok(prefix
            .iter()
            .map(|s| s.to_string())
            .chain(packages.iter().cloned())
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Img,
    Raw,
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Qcow2
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Distribution {
    /// Lookup key, e.g. `ubuntu-22.04`.
    pub key: String,
    /// Human readable name shown in menus.
    pub name: String,
    pub family: OsFamily,
    pub release: String,
    /// Cloud image location. `file://` URLs point at a local copy.
    pub url: String,
    #[serde(default)]
    pub format: ImageFormat,
    /// Expected SHA-256 of the downloaded file, hex encoded.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_user")]
    pub default_user: String,
    /// Whether the image consumes a cloud-init drive.
    #[serde(default = "default_true")]
    pub cloud_init: bool,
}

fn default_user() -> String {
    "cloud-user".to_string()
}

fn default_true() -> bool {
    true
}

impl Distribution {
    pub fn package_manager(&self) -> PackageManager {
        self.family.package_manager()
    }

    /// File name of the downloaded image, without any compression suffix.
    pub fn image_file_name(&self) -> String {
        let file_name = self
            .url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.key);
        file_name
            .strip_suffix(".xz")
            .unwrap_or(file_name)
            .to_owned()
    }

    pub fn is_compressed(&self) -> bool {
        self.url.ends_with(".xz")
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<16} {}", "Key:", self.key)?;
        writeln!(f, "{:<16} {}", "Name:", self.name)?;
        writeln!(f, "{:<16} {} ({})", "Family:", self.family, self.package_manager())?;
        writeln!(f, "{:<16} {}", "Release:", self.release)?;
        writeln!(f, "Image:")?;
        writeln!(indented(f), "{:<12} {}", "URL:", self.url)?;
        writeln!(indented(f), "{:<12} {}", "Format:", self.format)?;
        if let Some(sha256) = &self.sha256 {
            writeln!(indented(f), "{:<12} {}", "SHA-256:", sha256)?;
        }
        writeln!(f, "{:<16} {}", "Default user:", self.default_user)?;
        writeln!(f, "{:<16} {}", "Cloud-init:", self.cloud_init)
    }
}

/// Distributions available for template creation, keyed by [`Distribution::key`].
#[derive(Debug, Clone, Default)]
pub struct DistributionRegistry {
    distributions: BTreeMap<String, Distribution>,
}

impl DistributionRegistry {
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::default();
        registry
            .merge_yaml(BUILTIN_DISTRIBUTIONS)
            .with_context(|| "Failed to parse built-in distributions")?;
        Ok(registry)
    }

    /// Built-in registry extended by an optional user file.
    pub fn load(extra: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin()?;
        if let Some(path) = extra {
            registry.merge_file(path)?;
        }
        Ok(registry)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open distributions file {}", path.display()))?;
        let extra: Vec<Distribution> = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse distributions file {}", path.display()))?;
        tracing::debug!(
            "Loaded {} distributions from {}",
            extra.len(),
            path.display()
        );
        self.extend(extra);
        Ok(())
    }

    fn merge_yaml(&mut self, yaml: &str) -> Result<()> {
        let distributions: Vec<Distribution> = serde_yaml::from_str(yaml)?;
        self.extend(distributions);
        Ok(())
    }

    fn extend(&mut self, distributions: Vec<Distribution>) {
        for distribution in distributions {
            if self.distributions.contains_key(&distribution.key) {
                tracing::debug!("Overriding distribution {}", distribution.key);
            }
            self.distributions
                .insert(distribution.key.to_owned(), distribution);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Distribution> {
        self.distributions.get(key)
    }

    /// Like [`get`](Self::get), but an unknown key is an invalid parameter.
    pub fn lookup(&self, key: &str) -> Result<&Distribution> {
        self.get(key).ok_or_else(|| {
            ToolkitError::invalid(format!(
                "unknown distribution '{}', see --list-distributions",
                key
            ))
            .into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Distribution> {
        self.distributions.values()
    }

    pub fn by_family(&self, family: OsFamily) -> impl Iterator<Item = &Distribution> {
        self.iter().filter(move |d| d.family == family)
    }

    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }
}
