use anyhow::{bail, Context, Result};
use resources::objects::DockerTemplate;
use rpve::{RetryPolicy, Sandbox};

use crate::report::StatusEntry;

const INSTALL_SCRIPT_URL: &str = "https://get.docker.com";
const COMPOSE_ROOT: &str = "/opt";

pub struct DockerProvisioner<'s, 'a> {
    sandbox: &'s Sandbox<'a>,
    retry: RetryPolicy,
}

impl<'s, 'a> DockerProvisioner<'s, 'a> {
    pub fn new(sandbox: &'s Sandbox<'a>, retry: RetryPolicy) -> Self {
        Self {
            sandbox,
            retry,
        }
    }

    pub async fn install(&self) -> Result<()> {
        if self.sandbox.probe(["docker", "--version"]).await?.success() {
            tracing::info!("Docker already present in sandbox {}", self.sandbox.vmid());
            return Ok(());
        }
        tracing::info!("Installing Docker in sandbox {}...", self.sandbox.vmid());
        self.sandbox
            .install_packages(&["curl".to_string(), "ca-certificates".to_string()])
            .await?;
        let script = format!("curl -fsSL {} | sh", INSTALL_SCRIPT_URL);
        self.retry
            .run("Docker installation", || self.sandbox.exec_shell(&script))
            .await
            .with_context(|| "Failed to install Docker")?;
        self.sandbox
            .exec(["systemctl", "enable", "--now", "docker"])
            .await?;
        Ok(())
    }

    pub async fn deploy(&self, template: &DockerTemplate) -> Result<()> {
        for container in &template.containers {
            tracing::info!("Starting container {}...", container.name);
            self.retry
                .run(&format!("Pulling {}", container.image), || {
                    self.sandbox.exec(["docker", "pull", container.image.as_str()])
                })
                .await
                .with_context(|| format!("Failed to pull image {}", container.image))?;
            let mut args = vec!["docker".to_string()];
            args.extend(container.run_args());
            self.sandbox
                .exec(args)
                .await
                .with_context(|| format!("Failed to start container {}", container.name))?;
        }
        if let Some(compose) = &template.compose {
            let dir = format!("{}/{}", COMPOSE_ROOT, template.name);
            let file = format!("{}/compose.yaml", dir);
            tracing::info!("Bringing up compose project {}...", file);
            self.sandbox.exec(["mkdir", "-p", dir.as_str()]).await?;
            let write = format!("cat > {}", file);
            self.sandbox
                .exec_with_stdin(["sh", "-c", write.as_str()], compose)
                .await?;
            self.sandbox
                .exec(["docker", "compose", "-f", file.as_str(), "up", "-d"])
                .await
                .with_context(|| format!("Failed to start compose project {}", template.name))?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let output = self
            .sandbox
            .exec(["docker", "ps", "-a", "--format", "{{.Names}}\t{{.Status}}"])
            .await?;
        Ok(parse_ps(&output.stdout))
    }

    /// Every container of `template` must be running.
    pub async fn verify(&self, template: &DockerTemplate) -> Result<Vec<StatusEntry>> {
        let entries = self.status().await?;
        if self.sandbox.is_dry_run() {
            return Ok(entries);
        }
        let not_running = template
            .containers
            .iter()
            .filter(|c| !entries.iter().any(|e| e.name == c.name && e.healthy))
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        if !not_running.is_empty() {
            bail!("Containers not running: {}", not_running.join(", "));
        }
        Ok(entries)
    }
}

fn parse_ps(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(name, status)| StatusEntry {
            name: name.to_owned(),
            status: status.to_owned(),
            healthy: status.starts_with("Up") && !status.contains("(unhealthy)"),
        })
        .collect()
}
