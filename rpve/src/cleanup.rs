//! Resources created along the way that must go away again if a build fails
//! or is interrupted.

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};

use crate::{
    exec::CommandRunner,
    proxmox::{Ct, Vm},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    DestroyVm(u32),
    DestroyContainer(u32),
    RemoveDir(PathBuf),
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupAction::DestroyVm(vmid) => write!(f, "destroy VM {}", vmid),
            CleanupAction::DestroyContainer(vmid) => write!(f, "destroy container {}", vmid),
            CleanupAction::RemoveDir(dir) => write!(f, "remove {}", dir.display()),
        }
    }
}

impl CleanupAction {
    async fn execute(&self, runner: &dyn CommandRunner) -> Result<()> {
        match self {
            CleanupAction::DestroyVm(vmid) => {
                if !Vm::new(*vmid).destroy(runner).await? {
                    tracing::debug!("VM {} already gone", vmid);
                }
            },
            CleanupAction::DestroyContainer(vmid) => {
                if !Ct::new(*vmid).destroy(runner).await? {
                    tracing::debug!("Container {} already gone", vmid);
                }
            },
            CleanupAction::RemoveDir(dir) => {
                if runner.is_dry_run() {
                    tracing::info!("[dry-run] rm -rf {}", dir.display());
                    return Ok(());
                }
                match tokio::fs::remove_dir_all(dir).await {
                    Ok(()) => {},
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("Failed to remove {}", dir.display()))
                    },
                }
            },
        }
        Ok(())
    }
}

/// Identifies a registered action, see [`Cleanup::disarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupHandle(u64);

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    actions: Vec<(u64, CleanupAction)>,
}

/// Registry of pending cleanup actions, shared between the build and the
/// signal handler.
#[derive(Debug, Clone, Default)]
pub struct Cleanup {
    inner: Arc<Mutex<Registry>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // a panic while holding the lock leaves the list itself intact
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, action: CleanupAction) -> CleanupHandle {
        tracing::debug!("Registered cleanup: {}", action);
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.actions.push((id, action));
        CleanupHandle(id)
    }

    /// Forget an action, the resource is kept. Returns the action if it was pending.
    pub fn disarm(&self, handle: CleanupHandle) -> Option<CleanupAction> {
        let mut registry = self.registry();
        let index = registry
            .actions
            .iter()
            .position(|(id, _)| *id == handle.0)?;
        Some(registry.actions.remove(index).1)
    }

    pub fn pending(&self) -> Vec<CleanupAction> {
        self.registry()
            .actions
            .iter()
            .map(|(_, action)| action.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().actions.is_empty()
    }

    /// Execute a single action now and drop it from the registry.
    pub async fn run_one(&self, runner: &dyn CommandRunner, handle: CleanupHandle) -> Result<()> {
        match self.disarm(handle) {
            Some(action) => action.execute(runner).await,
            None => Ok(()),
        }
    }

    /// Execute every pending action, most recent first.
    ///
    /// A failing action does not stop the others; the first error is returned
    /// after all of them have been tried.
    pub async fn run(&self, runner: &dyn CommandRunner, retry: RetryPolicy) -> Result<()> {
        let actions = std::mem::take(&mut self.registry().actions);
        if actions.is_empty() {
            return Ok(());
        }
        tracing::info!("Cleaning up {} resource(s)...", actions.len());
        let mut first_error = None;
        for (_, action) in actions.into_iter().rev() {
            let what = action.to_string();
            let result = retry.run(&what, || action.execute(runner)).await;
            match result {
                Ok(()) => tracing::info!("Cleanup: {}", what),
                Err(err) => {
                    tracing::error!("Cleanup failed to {}: {:#}", what, err);
                    first_error.get_or_insert(err);
                },
            }
        }
        match first_error {
            Some(err) => Err(err.context("Cleanup did not complete")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exec::RecordingRunner;

    fn no_retry() -> RetryPolicy {
        RetryPolicy::new(1, Duration::ZERO)
    }

    #[tokio::test]
    async fn runs_in_reverse_order() {
        let runner = RecordingRunner::new();
        let cleanup = Cleanup::new();
        cleanup.register(CleanupAction::DestroyVm(9000));
        cleanup.register(CleanupAction::DestroyContainer(9001));

        cleanup.run(&runner, no_retry()).await.unwrap();
        assert_eq!(
            runner.lines(),
            vec![
                "pct status 9001",
                "pct stop 9001",
                "pct destroy 9001 --purge",
                "qm status 9000",
                "qm destroy 9000 --purge",
            ]
        );
        assert!(cleanup.is_empty());
    }

    #[tokio::test]
    async fn disarmed_actions_are_skipped() {
        let runner = RecordingRunner::new();
        let cleanup = Cleanup::new();
        let vm = cleanup.register(CleanupAction::DestroyVm(9000));
        let clone = cleanup.clone();
        assert_eq!(clone.disarm(vm), Some(CleanupAction::DestroyVm(9000)));
        assert_eq!(clone.disarm(vm), None);

        cleanup.run(&runner, no_retry()).await.unwrap();
        assert!(runner.lines().is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_actions() {
        let runner = RecordingRunner::new();
        runner.fail_on("qm destroy 9000");
        let cleanup = Cleanup::new();
        cleanup.register(CleanupAction::DestroyVm(9000));
        cleanup.register(CleanupAction::DestroyVm(9001));

        let err = cleanup
            .run(&runner, RetryPolicy::new(2, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("VM 9000"));
        let lines = runner.lines();
        assert_eq!(
            lines.iter().filter(|l| *l == "qm destroy 9000 --purge").count(),
            2
        );
        assert!(lines.contains(&"qm destroy 9001 --purge".to_string()));
    }

    #[tokio::test]
    async fn removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(work.join("nested")).unwrap();
        let cleanup = Cleanup::new();
        let handle = cleanup.register(CleanupAction::RemoveDir(work.clone()));

        cleanup.run_one(&RecordingRunner::new(), handle).await.unwrap();
        assert!(!work.exists());
        assert!(cleanup.is_empty());
    }
}
