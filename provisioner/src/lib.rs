//! Docker and Kubernetes workloads, provisioned and verified inside a
//! disposable LXC sandbox.

use std::time::Duration;

use anyhow::Result;
use resources::{
    config::Settings,
    objects::{DockerTemplate, K8sTemplate},
};
use rpve::{Cleanup, CommandRunner, RetryPolicy, Sandbox, VmidAllocator};

pub mod docker;
pub mod kubernetes;
pub mod report;

pub use docker::DockerProvisioner;
pub use kubernetes::K8sProvisioner;
pub use report::{StatusEntry, WorkloadReport};

#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Docker(DockerTemplate),
    Kubernetes(K8sTemplate),
}

impl Workload {
    pub fn name(&self) -> &str {
        match self {
            Workload::Docker(t) => &t.name,
            Workload::Kubernetes(t) => &t.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Workload::Docker(_) => "docker",
            Workload::Kubernetes(_) => "kubernetes",
        }
    }

    /// Hostname of the sandbox running this workload.
    fn hostname(&self) -> String {
        let name = self
            .name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>();
        let name = name.trim_matches('-');
        let mut hostname = format!("{}-sandbox", if name.is_empty() { "workload" } else { name });
        hostname.truncate(63);
        hostname
    }
}

pub struct Provisioner<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    cleanup: Cleanup,
    keep_sandbox: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings, cleanup: Cleanup) -> Self {
        Self {
            runner,
            settings,
            cleanup,
            keep_sandbox: false,
        }
    }

    /// Leave the sandbox running after provisioning.
    pub fn keep_sandbox(mut self, keep: bool) -> Self {
        self.keep_sandbox = keep;
        self
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.max_retry_attempts,
            Duration::from_secs(self.settings.retry_delay_secs),
        )
    }

    /// Create a sandbox, deploy `workload` into it, verify it and tear the
    /// sandbox down again.
    pub async fn provision(&self, workload: &Workload) -> Result<WorkloadReport> {
        tracing::info!("Provisioning {} workload {}...", workload.kind(), workload.name());
        let mut allocator = VmidAllocator::from_settings(self.settings);
        if self.runner.is_dry_run() {
            allocator = allocator.without_lock();
        }
        let sandbox = Sandbox::create(
            self.runner,
            &self.cleanup,
            &allocator,
            &self.settings.sandbox,
            &workload.hostname(),
        )
        .await?;
        let vmid = sandbox.vmid();

        let result = self.deploy(&sandbox, workload).await;

        let kept = self.keep_sandbox;
        if kept {
            sandbox.keep();
        } else if let Err(err) = sandbox.destroy().await {
            if result.is_ok() {
                return Err(err);
            }
            tracing::error!("Failed to destroy sandbox {}: {:#}", vmid, err);
        }

        let entries = result?;
        let report = WorkloadReport {
            kind: workload.kind(),
            template: workload.name().to_owned(),
            sandbox: vmid,
            kept,
            entries,
        };
        tracing::info!("Workload {} verified in sandbox {}", workload.name(), vmid);
        Ok(report)
    }

    async fn deploy(&self, sandbox: &Sandbox<'_>, workload: &Workload) -> Result<Vec<StatusEntry>> {
        match workload {
            Workload::Docker(template) => {
                let docker = DockerProvisioner::new(sandbox, self.retry());
                docker.install().await?;
                docker.deploy(template).await?;
                docker.verify(template).await
            },
            Workload::Kubernetes(template) => {
                let k8s = K8sProvisioner::new(sandbox, self.retry());
                k8s.install(template).await?;
                k8s.deploy(template).await?;
                k8s.verify().await
            },
        }
    }
}
