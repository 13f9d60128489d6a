use std::time::Duration;

use anyhow::{bail, Context, Result};
use resources::objects::{workload::Manifest, K8sTemplate};
use rpve::{Output, RetryPolicy, Sandbox};

use crate::report::StatusEntry;

const K3S_INSTALL_URL: &str = "https://get.k3s.io";
const HELM_INSTALL_URL: &str = "https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3";
const KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

pub struct K8sProvisioner<'s, 'a> {
    sandbox: &'s Sandbox<'a>,
    retry: RetryPolicy,
    /// Polling used while waiting for the node and pods.
    readiness: RetryPolicy,
}

impl<'s, 'a> K8sProvisioner<'s, 'a> {
    pub fn new(sandbox: &'s Sandbox<'a>, retry: RetryPolicy) -> Self {
        Self {
            sandbox,
            retry,
            readiness: RetryPolicy::new(30, Duration::from_secs(10)),
        }
    }

    pub fn with_readiness(mut self, readiness: RetryPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    async fn kubectl(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = vec!["k3s", "kubectl"];
        cmd.extend_from_slice(args);
        self.sandbox.exec(cmd).await
    }

    async fn helm(&self, args: Vec<String>) -> Result<Output> {
        let mut cmd = vec!["env".to_string(), format!("KUBECONFIG={}", KUBECONFIG), "helm".to_string()];
        cmd.extend(args);
        self.sandbox.exec(cmd).await
    }

    pub async fn install(&self, template: &K8sTemplate) -> Result<()> {
        tracing::info!("Installing k3s in sandbox {}...", self.sandbox.vmid());
        self.sandbox
            .install_packages(&["curl".to_string(), "ca-certificates".to_string()])
            .await?;
        let exec = format!("INSTALL_K3S_EXEC={}", template.install_args.join(" "));
        let script = format!("curl -sfL {} | sh -", K3S_INSTALL_URL);
        self.retry
            .run("k3s installation", || {
                self.sandbox.exec(["env", exec.as_str(), "sh", "-c", script.as_str()])
            })
            .await
            .with_context(|| "Failed to install k3s")?;
        self.wait_ready().await
    }

    pub async fn wait_ready(&self) -> Result<()> {
        if self.sandbox.is_dry_run() {
            return Ok(());
        }
        tracing::info!("Waiting for the k3s node to become Ready...");
        self.readiness
            .run("Node readiness", || async move {
                let output = self.kubectl(&["get", "nodes", "--no-headers"]).await?;
                if nodes_ready(&output.stdout) {
                    Ok(())
                } else {
                    bail!("Node not ready yet")
                }
            })
            .await
            .with_context(|| "k3s node did not become Ready")
    }

    pub async fn deploy(&self, template: &K8sTemplate) -> Result<()> {
        for manifest in &template.manifests {
            match manifest {
                Manifest::Url {
                    url,
                } => {
                    tracing::info!("Applying manifest {}...", url);
                    self.kubectl(&["apply", "-f", url.as_str()])
                        .await
                        .with_context(|| format!("Failed to apply {}", url))?;
                },
                Manifest::Inline {
                    inline,
                } => {
                    tracing::info!("Applying inline manifest...");
                    self.sandbox
                        .exec_with_stdin(["k3s", "kubectl", "apply", "-f", "-"], inline)
                        .await
                        .with_context(|| "Failed to apply inline manifest")?;
                },
            }
        }
        if template.charts.is_empty() {
            return Ok(());
        }
        self.install_helm().await?;
        for chart in &template.charts {
            tracing::info!("Installing chart {} as {}...", chart.chart, chart.release);
            self.helm(vec![
                "repo".to_string(),
                "add".to_string(),
                "--force-update".to_string(),
                chart.repo_name.to_owned(),
                chart.repo_url.to_owned(),
            ])
            .await?;
            self.helm(vec!["repo".to_string(), "update".to_string()])
                .await?;
            self.helm(chart.install_args())
                .await
                .with_context(|| format!("Failed to install chart {}", chart.chart))?;
        }
        Ok(())
    }

    async fn install_helm(&self) -> Result<()> {
        if self.sandbox.probe(["helm", "version"]).await?.success() {
            return Ok(());
        }
        tracing::info!("Installing helm...");
        let script = format!("curl -fsSL {} | bash", HELM_INSTALL_URL);
        self.retry
            .run("helm installation", || self.sandbox.exec_shell(&script))
            .await
            .with_context(|| "Failed to install helm")?;
        Ok(())
    }

    pub async fn status(&self) -> Result<Vec<StatusEntry>> {
        let output = self.kubectl(&["get", "pods", "-A", "--no-headers"]).await?;
        Ok(parse_pods(&output.stdout))
    }

    /// Wait until every pod is running or completed.
    pub async fn verify(&self) -> Result<Vec<StatusEntry>> {
        if self.sandbox.is_dry_run() {
            return self.status().await;
        }
        self.readiness
            .run("Pod readiness", || async move {
                let entries = self.status().await?;
                let failing = entries
                    .iter()
                    .filter(|e| !e.healthy)
                    .map(|e| format!("{} ({})", e.name, e.status))
                    .collect::<Vec<_>>();
                if failing.is_empty() {
                    Ok(entries)
                } else {
                    bail!("Pods not ready: {}", failing.join(", "))
                }
            })
            .await
    }
}

fn nodes_ready(output: &str) -> bool {
    let mut nodes = output.lines().filter(|l| !l.trim().is_empty()).peekable();
    nodes.peek().is_some()
        && nodes.all(|line| line.split_whitespace().nth(1) == Some("Ready"))
}

/// Parse `kubectl get pods -A --no-headers`: namespace, name, ready, status, ...
fn parse_pods(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter_map(|line| {
            let columns = line.split_whitespace().collect::<Vec<_>>();
            if columns.len() < 4 {
                return None;
            }
            let (ready, status) = (columns[2], columns[3]);
            let healthy = match status {
                "Completed" | "Succeeded" => true,
                "Running" => all_ready(ready),
                _ => false,
            };
            Some(StatusEntry {
                name: format!("{}/{}", columns[0], columns[1]),
                status: format!("{} {}", status, ready),
                healthy,
            })
        })
        .collect()
}

/// `2/2` but not `1/2`.
fn all_ready(ready: &str) -> bool {
    match ready.split_once('/') {
        Some((up, total)) => match (up.parse::<u32>(), total.parse::<u32>()) {
            (Ok(up), Ok(total)) => total > 0 && up == total,
            _ => false,
        },
        None => false,
    }
}
