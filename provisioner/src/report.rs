use std::fmt::{self, Write};

use indenter::indented;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub name: String,
    pub status: String,
    pub healthy: bool,
}

/// Outcome of provisioning a workload in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadReport {
    /// `docker` or `kubernetes`.
    pub kind: &'static str,
    pub template: String,
    pub sandbox: u32,
    /// Whether the sandbox container was left running.
    pub kept: bool,
    pub entries: Vec<StatusEntry>,
}

impl WorkloadReport {
    pub fn healthy(&self) -> bool {
        self.entries.iter().all(|entry| entry.healthy)
    }
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<16} {} ({})", "Workload:", self.template, self.kind)?;
        let sandbox = if self.kept {
            format!("{} (kept)", self.sandbox)
        } else {
            format!("{} (destroyed)", self.sandbox)
        };
        writeln!(f, "{:<16} {}", "Sandbox:", sandbox)?;
        if self.entries.is_empty() {
            return writeln!(f, "{:<16} <none>", "Status:");
        }
        writeln!(f, "Status:")?;
        for entry in &self.entries {
            let mark = if entry.healthy { "ok" } else { "!!" };
            writeln!(indented(f), "{} {:<40} {}", mark, entry.name, entry.status)?;
        }
        Ok(())
    }
}
