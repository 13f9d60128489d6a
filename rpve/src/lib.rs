//! Proxmox side of template creation: everything that ends up as a `qm`,
//! `pct`, `pvesm` or `virt-customize` invocation.

pub mod cleanup;
pub mod cloud_init;
pub mod deps;
pub mod exec;
pub mod image;
pub mod proxmox;
pub mod retry;
pub mod sandbox;
pub mod template;
pub mod vmid;

pub use cleanup::{Cleanup, CleanupAction};
pub use exec::{Cmd, CommandRunner, DryRunRunner, Output, RecordingRunner, SystemRunner};
pub use retry::RetryPolicy;
pub use sandbox::Sandbox;
pub use template::{BuiltTemplate, TemplateBuilder};
pub use vmid::VmidAllocator;
