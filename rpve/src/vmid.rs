//! VMID allocation.
//!
//! Finding a free id and claiming it with `qm create`/`pct create` are two
//! separate steps, so allocation happens under an exclusive lock file that
//! is held by the returned [`VmidReservation`] until the guest exists.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use anyhow::{bail, Context, Result};
use resources::{
    config::Settings,
    models::ToolkitError,
    objects::template::validate_vmid,
};

use crate::{
    exec::CommandRunner,
    proxmox::{Ct, Vm},
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOCK_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id()).ok();
                    tracing::debug!("Acquired VMID lock {}", path.display());
                    return Ok(Self {
                        path: path.to_owned(),
                    });
                },
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(path, stale_after) {
                        tracing::warn!("Breaking stale VMID lock {}", path.display());
                        fs::remove_file(path).ok();
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        bail!(
                            "Timed out waiting for VMID lock {}, is another instance running?",
                            path.display()
                        );
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                },
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to create lock file {}", path.display()))
                },
            }
        }
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(false, |age| age > stale_after)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove VMID lock {}: {}", self.path.display(), err);
        }
    }
}

/// A VMID that nobody else can allocate until this is dropped or released.
#[derive(Debug)]
pub struct VmidReservation {
    vmid: u32,
    lock: Option<LockFile>,
}

impl VmidReservation {
    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Release the lock once the guest has been created.
    pub fn release(mut self) -> u32 {
        self.lock.take();
        self.vmid
    }
}

#[derive(Debug, Clone)]
pub struct VmidAllocator {
    start: u32,
    end: u32,
    lock_file: Option<PathBuf>,
    stale_after: Duration,
}

impl VmidAllocator {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            lock_file: None,
            stale_after: Duration::from_secs(600),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.vmid_start, settings.vmid_end)
            .with_lock(&settings.vmid_lock_file, Duration::from_secs(settings.vmid_lock_stale_secs))
    }

    pub fn with_lock(mut self, path: &Path, stale_after: Duration) -> Self {
        self.lock_file = Some(path.to_owned());
        self.stale_after = stale_after;
        self
    }

    /// Allocate without locking, for dry runs.
    pub fn without_lock(mut self) -> Self {
        self.lock_file = None;
        self
    }

    /// Reserve `requested`, or the next free VMID when `None`.
    pub async fn reserve(
        &self,
        runner: &dyn CommandRunner,
        requested: Option<u32>,
    ) -> Result<VmidReservation> {
        let lock = match &self.lock_file {
            Some(path) => Some(LockFile::acquire(path, self.stale_after).await?),
            None => None,
        };
        let vmid = match requested {
            Some(vmid) => {
                validate_vmid(vmid)?;
                if is_used(runner, vmid).await? {
                    return Err(
                        ToolkitError::invalid(format!("VMID {} is already in use", vmid)).into(),
                    );
                }
                vmid
            },
            None => self.next_available(runner).await?,
        };
        tracing::info!("Reserved VMID {}", vmid);
        Ok(VmidReservation {
            vmid,
            lock,
        })
    }

    /// First VMID from `start` used by neither a VM nor a container.
    pub async fn next_available(&self, runner: &dyn CommandRunner) -> Result<u32> {
        for vmid in self.start..=self.end {
            if !is_used(runner, vmid).await? {
                return Ok(vmid);
            }
            tracing::debug!("VMID {} is in use", vmid);
        }
        bail!("No free VMID between {} and {}", self.start, self.end)
    }
}

pub async fn is_used(runner: &dyn CommandRunner, vmid: u32) -> Result<bool> {
    Ok(Vm::new(vmid).exists(runner).await? || Ct::new(vmid).exists(runner).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Output, RecordingRunner};
    use resources::models::{exit_code_of, ExitCode};

    fn runner_with_used(used_vms: &[u32], used_cts: &[u32]) -> RecordingRunner {
        let runner = RecordingRunner::new();
        for id in used_vms {
            runner.respond(format!("qm status {}", id), Output::ok("status: stopped"));
        }
        for id in used_cts {
            runner.respond(format!("pct status {}", id), Output::ok("status: running"));
        }
        runner.fail_on("qm status").fail_on("pct status");
        runner
    }

    #[tokio::test]
    async fn skips_vms_and_containers() {
        let runner = runner_with_used(&[1000, 1001], &[1002]);
        let allocator = VmidAllocator::new(1000, 2000);
        assert_eq!(allocator.next_available(&runner).await.unwrap(), 1003);
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        let runner = runner_with_used(&[100, 101], &[]);
        let allocator = VmidAllocator::new(100, 101);
        assert!(allocator.next_available(&runner).await.is_err());
    }

    #[tokio::test]
    async fn requested_vmid_in_use_is_invalid() {
        let runner = runner_with_used(&[9000], &[]);
        let allocator = VmidAllocator::new(1000, 2000);
        let err = allocator.reserve(&runner, Some(9000)).await.unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidParameters);
        assert_eq!(allocator.reserve(&runner, Some(9001)).await.unwrap().vmid(), 9001);
    }

    #[tokio::test]
    async fn lock_is_held_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("locks/vmid.lock");
        let runner = runner_with_used(&[], &[]);
        let allocator = VmidAllocator::new(1000, 2000).with_lock(&lock, Duration::from_secs(600));

        let reservation = allocator.reserve(&runner, None).await.unwrap();
        assert!(lock.exists());
        assert_eq!(reservation.release(), 1000);
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("vmid.lock");
        fs::write(&lock, "12345").unwrap();
        let runner = runner_with_used(&[], &[]);
        let allocator = VmidAllocator::new(1000, 2000).with_lock(&lock, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reservation = allocator.reserve(&runner, None).await.unwrap();
        assert_eq!(reservation.vmid(), 1000);
    }
}
