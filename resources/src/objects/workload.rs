use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::ToolkitError;

const BUILTIN_WORKLOADS: &str = include_str!("../../data/workloads.yaml");

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::UnlessStopped
    }
}

/// A set of containers started inside a Docker sandbox.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DockerTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub containers: Vec<DockerContainer>,
    /// Inline docker-compose document, brought up after the containers.
    #[serde(default)]
    pub compose: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DockerContainer {
    pub name: String,
    pub image: String,
    /// `host:container` port mappings.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// `source:target[:mode]` volume mappings.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Arguments passed after the image name.
    #[serde(default)]
    pub command: Vec<String>,
}

impl DockerContainer {
    /// Arguments for `docker`, starting with `run`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.to_owned(),
            "--restart".to_string(),
            self.restart.to_string(),
        ];
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.to_owned());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.to_owned());
        }
        args.push(self.image.to_owned());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A k3s cluster plus the manifests and charts deployed onto it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct K8sTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Extra arguments for the k3s installer, e.g. `--disable traefik`.
    #[serde(default)]
    pub install_args: Vec<String>,
    #[serde(default)]
    pub manifests: Vec<Manifest>,
    #[serde(default)]
    pub charts: Vec<HelmChart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Manifest {
    Url { url: String },
    Inline { inline: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HelmChart {
    pub repo_name: String,
    pub repo_url: String,
    /// Chart reference, usually `<repo_name>/<chart>`.
    pub chart: String,
    pub release: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Passed as `--set key=value`.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl HelmChart {
    /// Arguments for `helm`, starting with `upgrade --install`.
    pub fn install_args(&self) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.release.to_owned(),
            self.chart.to_owned(),
            "--namespace".to_string(),
            self.namespace.to_owned(),
            "--create-namespace".to_string(),
            "--wait".to_string(),
        ];
        if let Some(version) = &self.version {
            args.push("--version".to_string());
            args.push(version.to_owned());
        }
        for (key, value) in &self.values {
            args.push("--set".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

#[derive(Debug, Deserialize, Default)]
struct CatalogFile {
    #[serde(default)]
    docker: Vec<DockerTemplate>,
    #[serde(default)]
    kubernetes: Vec<K8sTemplate>,
}

/// A single user supplied template file.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WorkloadFile {
    Docker(DockerTemplate),
    Kubernetes(K8sTemplate),
}

impl WorkloadFile {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open workload file {}", path.display()))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse workload file {}", path.display()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadCatalog {
    docker: BTreeMap<String, DockerTemplate>,
    kubernetes: BTreeMap<String, K8sTemplate>,
}

impl WorkloadCatalog {
    pub fn builtin() -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(BUILTIN_WORKLOADS)
            .with_context(|| "Failed to parse built-in workloads")?;
        let mut catalog = Self::default();
        for template in file.docker {
            catalog.docker.insert(template.name.to_owned(), template);
        }
        for template in file.kubernetes {
            catalog.kubernetes.insert(template.name.to_owned(), template);
        }
        Ok(catalog)
    }

    /// Built-in templates plus every `*.yaml`/`*.yml` file in `dir`, if it exists.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        if !dir.is_dir() {
            return Ok(catalog);
        }
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("Failed to read workloads dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths {
            match WorkloadFile::load(&path) {
                Ok(WorkloadFile::Docker(t)) => {
                    catalog.docker.insert(t.name.to_owned(), t);
                },
                Ok(WorkloadFile::Kubernetes(t)) => {
                    catalog.kubernetes.insert(t.name.to_owned(), t);
                },
                Err(err) => tracing::warn!("Skipping workload file: {:#}", err),
            }
        }
        Ok(catalog)
    }

    /// Resolve a Docker template by catalog name or file path.
    pub fn docker(&self, name_or_path: &str) -> Result<DockerTemplate> {
        if let Some(template) = self.docker.get(name_or_path) {
            return Ok(template.clone());
        }
        let path = Path::new(name_or_path);
        if path.is_file() {
            return match WorkloadFile::load(path)? {
                WorkloadFile::Docker(t) => Ok(t),
                WorkloadFile::Kubernetes(_) => Err(ToolkitError::invalid(format!(
                    "{} is a kubernetes template, not a docker one",
                    path.display()
                ))
                .into()),
            };
        }
        Err(ToolkitError::invalid(format!(
            "unknown docker template '{}', available: {}",
            name_or_path,
            self.docker_names().join(", ")
        ))
        .into())
    }

    /// Resolve a Kubernetes template by catalog name or file path.
    pub fn kubernetes(&self, name_or_path: &str) -> Result<K8sTemplate> {
        if let Some(template) = self.kubernetes.get(name_or_path) {
            return Ok(template.clone());
        }
        let path = Path::new(name_or_path);
        if path.is_file() {
            return match WorkloadFile::load(path)? {
                WorkloadFile::Kubernetes(t) => Ok(t),
                WorkloadFile::Docker(_) => Err(ToolkitError::invalid(format!(
                    "{} is a docker template, not a kubernetes one",
                    path.display()
                ))
                .into()),
            };
        }
        Err(ToolkitError::invalid(format!(
            "unknown kubernetes template '{}', available: {}",
            name_or_path,
            self.kubernetes_names().join(", ")
        ))
        .into())
    }

    pub fn docker_templates(&self) -> impl Iterator<Item = &DockerTemplate> {
        self.docker.values()
    }

    pub fn kubernetes_templates(&self) -> impl Iterator<Item = &K8sTemplate> {
        self.kubernetes.values()
    }

    pub fn docker_names(&self) -> Vec<String> {
        self.docker.keys().cloned().collect()
    }

    pub fn kubernetes_names(&self) -> Vec<String> {
        self.kubernetes.keys().cloned().collect()
    }
}
