use std::path::PathBuf;

use anyhow::{Context, Result};
use resources::objects::{Distribution, OsFamily};
use serde::Serialize;

use crate::exec::CommandRunner;

const GUEST_AGENT: &str = "qemu-guest-agent";
const DEFAULT_TIMEZONE: &str = "Etc/UTC";

/// `#cloud-config` vendor data, merged by cloud-init below the user data
/// Proxmox generates from `--ciuser`, `--sshkeys` and `--ipconfig0`.
#[derive(Debug, Serialize, PartialEq)]
struct VendorData {
    package_update: bool,
    packages: Vec<String>,
    timezone: String,
    runcmd: Vec<Vec<String>>,
}

impl VendorData {
    fn for_distribution(distro: &Distribution, timezone: &str) -> Self {
        let enable_agent: Vec<&str> = match distro.family {
            OsFamily::Alpine => vec!["rc-update", "add", GUEST_AGENT, "default"],
            _ => vec!["systemctl", "enable", "--now", GUEST_AGENT],
        };
        let mut runcmd = vec![enable_agent.into_iter().map(str::to_owned).collect()];
        if distro.family == OsFamily::Alpine {
            runcmd.push(vec!["rc-service".into(), GUEST_AGENT.into(), "start".into()]);
        }
        Self {
            package_update: true,
            packages: vec![GUEST_AGENT.to_string()],
            timezone: timezone.to_owned(),
            runcmd,
        }
    }

    fn render(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        let body = yaml.strip_prefix("---\n").unwrap_or(&yaml);
        Ok(format!("#cloud-config\n{}", body))
    }
}

/// A snippet file on a Proxmox storage with the `snippets` content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub path: PathBuf,
    /// Volume id for `--cicustom`, e.g. `local:snippets/vendor-9000.yaml`.
    pub volume: String,
}

impl Snippet {
    pub fn cicustom(&self) -> String {
        format!("vendor={}", self.volume)
    }
}

#[derive(Debug, Clone)]
pub struct SnippetStore {
    storage: String,
    dir: PathBuf,
    timezone: String,
}

impl SnippetStore {
    pub fn new(storage: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: storage.into(),
            dir: dir.into(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Write the vendor data snippet of VM `vmid`. Returns `None` for
    /// distributions without cloud-init.
    pub async fn write_vendor_data(
        &self,
        runner: &dyn CommandRunner,
        vmid: u32,
        distro: &Distribution,
    ) -> Result<Option<Snippet>> {
        if !distro.cloud_init {
            tracing::info!("{} does not use cloud-init, no snippet written", distro.key);
            return Ok(None);
        }
        let file_name = format!("vendor-{}.yaml", vmid);
        let snippet = Snippet {
            path: self.dir.join(&file_name),
            volume: format!("{}:snippets/{}", self.storage, file_name),
        };
        let content = VendorData::for_distribution(distro, &self.timezone).render()?;
        if runner.is_dry_run() {
            tracing::info!(
                "[dry-run] would write {}:\n{}",
                snippet.path.display(),
                content
            );
            return Ok(Some(snippet));
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create snippets directory {}", self.dir.display()))?;
        tokio::fs::write(&snippet.path, content)
            .await
            .with_context(|| format!("Failed to write snippet {}", snippet.path.display()))?;
        tracing::info!("Wrote cloud-init vendor data {}", snippet.volume);
        Ok(Some(snippet))
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::DistributionRegistry;

    use super::*;
    use crate::exec::{DryRunRunner, SystemRunner};

    #[test]
    fn vendor_data_is_cloud_config() {
        let registry = DistributionRegistry::builtin().unwrap();
        let rendered = VendorData::for_distribution(registry.get("debian-12").unwrap(), "Europe/Berlin")
            .render()
            .unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["package_update"], serde_yaml::Value::Bool(true));
        assert_eq!(parsed["packages"][0].as_str(), Some(GUEST_AGENT));
        assert_eq!(parsed["timezone"].as_str(), Some("Europe/Berlin"));
        assert_eq!(parsed["runcmd"][0][0].as_str(), Some("systemctl"));
    }

    #[test]
    fn alpine_uses_openrc() {
        let registry = DistributionRegistry::builtin().unwrap();
        let alpine = registry.by_family(OsFamily::Alpine).next().unwrap();
        let data = VendorData::for_distribution(alpine, DEFAULT_TIMEZONE);
        assert_eq!(data.runcmd[0][0], "rc-update");
        assert_eq!(data.runcmd.len(), 2);
    }

    #[tokio::test]
    async fn writes_snippet_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnippetStore::new("local", dir.path());
        let registry = DistributionRegistry::builtin().unwrap();
        let snippet = store
            .write_vendor_data(&SystemRunner::default(), 9000, registry.get("debian-12").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snippet.cicustom(), "vendor=local:snippets/vendor-9000.yaml");
        let content = std::fs::read_to_string(&snippet.path).unwrap();
        assert!(content.contains(GUEST_AGENT));
        assert!(content.contains("timezone: Etc/UTC"));
    }

    #[tokio::test]
    async fn dry_run_and_non_cloud_init_skip_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnippetStore::new("local", dir.path().join("snippets"));
        let registry = DistributionRegistry::builtin().unwrap();
        let mut distro = registry.get("debian-12").unwrap().clone();

        let snippet = store.write_vendor_data(&DryRunRunner, 9000, &distro).await.unwrap();
        assert!(snippet.is_some());
        assert!(!dir.path().join("snippets").exists());

        distro.cloud_init = false;
        let snippet = store
            .write_vendor_data(&SystemRunner::default(), 9000, &distro)
            .await
            .unwrap();
        assert!(snippet.is_none());
    }
}
