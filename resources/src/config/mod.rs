pub mod batch;
pub mod conf_file;
pub mod settings;

pub use batch::{BatchEntry, BatchQueue};
pub use conf_file::ConfFile;
pub use settings::{AnsibleSettings, SandboxSettings, Settings, TerraformSettings};
