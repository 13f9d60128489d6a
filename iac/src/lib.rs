//! Post-configuration artifacts for built templates: Terraform modules that
//! clone them and Ansible inventories/playbooks that configure the clones.

pub mod ansible;
pub mod terraform;

pub use ansible::{Ansible, AnsibleFiles, Inventory};
pub use terraform::{Terraform, TerraformModule};
