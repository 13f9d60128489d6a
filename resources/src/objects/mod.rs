pub mod distribution;
pub mod template;
pub mod workload;

pub use distribution::{Distribution, DistributionRegistry, OsFamily, PackageManager};
pub use template::{Bios, TemplateConfig};
pub use workload::{DockerTemplate, K8sTemplate, WorkloadCatalog};
