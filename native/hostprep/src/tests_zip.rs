//! Stages the `DATA` payload of a tests build onto the device's userdata partition.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use const_format::concatcp;
use tokio::{fs, time::sleep};
use tracing::{debug, info, instrument, warn};

use crate::{
    Error, Result,
    device::{DEVICE_TMP_DIR, RecoveryMode, TestDevice, UnixPath, UnixPathBuf, shell_quote},
};

/// Userdata partition root on the device
pub const DATA_DIR: &str = "/data";
/// Directory inside the tests build holding the userdata payload
pub const TESTS_ZIP_DATA_DIR: &str = "DATA";
/// Removal attempts per entry before giving up
pub const DEFAULT_RM_ATTEMPTS: u32 = 3;

const WRITE_PROBE_PATH: &str = concatcp!(DEVICE_TMP_DIR, "/write_probe");
const WRITE_PROBE_CONTENT: &str = "probe";

/// Pause between removal attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    Fixed(Duration),
}

/// How often a device-side removal is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_RM_ATTEMPTS, backoff: Backoff::None }
    }
}

/// Metadata of the build whose tests payload gets staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuildInfo {
    pub build_id: String,
    pub build_flavor: String,
    /// Extracted tests zip; its `DATA` directory mirrors `/data` on the device
    pub tests_dir: PathBuf,
}

impl DeviceBuildInfo {
    pub fn new(
        build_id: impl Into<String>,
        build_flavor: impl Into<String>,
        tests_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { build_id: build_id.into(), build_flavor: build_flavor.into(), tests_dir: tests_dir.into() }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.tests_dir.join(TESTS_ZIP_DATA_DIR)
    }
}

/// Wipes `/data` (minus a skip list) and syncs a tests build's payload onto it
#[derive(Debug, Clone, Default)]
pub struct TestsZipInstaller {
    /// Entry names directly under `/data` that are never deleted
    skip_list: BTreeSet<String>,
    retry: RetryPolicy,
}

impl TestsZipInstaller {
    pub fn new<I, S>(skip_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { skip_list: skip_list.into_iter().map(Into::into).collect(), retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn skip_list(&self) -> &BTreeSet<String> {
        &self.skip_list
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Top-level entries of the host payload directory, each synced onto `/data` as a unit
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_tests_zip_data_files(&self, host_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut rd = fs::read_dir(host_dir)
            .await
            .with_context(|| format!("Could not read tests data directory {}", host_dir.display()))
            .map_err(Error::setup)?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", host_dir.display()))
            .map_err(Error::setup)?
        {
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    }

    /// Device paths of every directory under `host_dir`, mapped onto `device_root`
    #[instrument(level = "debug", skip(self), err)]
    pub async fn find_dirs(
        &self,
        host_dir: &Path,
        device_root: &UnixPath,
    ) -> Result<BTreeSet<UnixPathBuf>> {
        let mut dirs = BTreeSet::new();
        let mut stack = vec![(host_dir.to_path_buf(), device_root.to_path_buf())];
        while let Some((host_path, device_path)) = stack.pop() {
            let mut rd = fs::read_dir(&host_path)
                .await
                .with_context(|| format!("Failed to read {}", host_path.display()))
                .map_err(Error::setup)?;
            while let Some(entry) = rd.next_entry().await.map_err(|e| Error::setup(e.into()))? {
                let file_type = entry.file_type().await.map_err(|e| Error::setup(e.into()))?;
                if !file_type.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let name = name
                    .to_str()
                    .with_context(|| format!("Non UTF-8 name under {}", host_path.display()))
                    .map_err(Error::setup)?;
                let device_child = device_path.join(name);
                dirs.insert(device_child.clone());
                stack.push((entry.path(), device_child));
            }
        }
        Ok(dirs)
    }

    /// Deletes everything under `/data` except the skip list.
    ///
    /// A write probe runs first and nothing is deleted when the filesystem isn't writable.
    /// The device recovery mode is lowered to [`RecoveryMode::Online`] for the duration and
    /// restored afterwards, whether the wipe succeeded or not.
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn delete_data<D: TestDevice + ?Sized>(&self, device: &D) -> Result<()> {
        let cached_mode = device.recovery_mode();
        device.set_recovery_mode(RecoveryMode::Online);
        let result = self.wipe_data(device).await;
        device.set_recovery_mode(cached_mode);
        result
    }

    async fn wipe_data<D: TestDevice + ?Sized>(&self, device: &D) -> Result<()> {
        let probe = UnixPath::new(WRITE_PROBE_PATH);
        if !device.push_string(WRITE_PROBE_CONTENT, probe).await? {
            return Err(Error::TargetSetup(format!(
                "failed write test on {}, filesystem may be read-only",
                device.serial_number()
            )));
        }
        device.execute_shell_command(&format!("rm -f {WRITE_PROBE_PATH}")).await?;

        let data = UnixPath::new(DATA_DIR);
        for name in device.list_dir(data).await? {
            if self.skip_list.contains(&name) {
                debug!(name = %name, "Skipping protected entry");
                continue;
            }
            self.delete_with_retry(device, &data.join(&name)).await?;
        }
        Ok(())
    }

    /// `rm -r` until the path is gone, giving up after the configured attempts
    async fn delete_with_retry<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        path: &UnixPath,
    ) -> Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let output = device
                .execute_shell_command(&format!("rm -r {}", quoted_path(path)))
                .await?;
            if !device.does_file_exist(path).await? {
                debug!(path = %path.display(), attempt, "Deleted");
                return Ok(());
            }
            warn!(
                path = %path.display(),
                attempt,
                max_attempts,
                output = %output.trim(),
                "Path still present after delete"
            );
            if let Backoff::Fixed(delay) = self.retry.backoff
                && attempt < max_attempts
            {
                sleep(delay).await;
            }
        }
        Err(Error::TargetSetup(format!(
            "failed to delete {} on {} after {max_attempts} attempts",
            path.display(),
            device.serial_number()
        )))
    }

    /// Stops the framework, wipes `/data` and syncs the build's `DATA` payload onto it.
    ///
    /// Synced directories are handed back to `system.system`; pushed files are owned by root.
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn push_tests_zip_onto_data<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        build: &DeviceBuildInfo,
    ) -> Result<()> {
        info!(
            serial = device.serial_number(),
            build_id = %build.build_id,
            "Pushing tests zip content onto userdata"
        );
        device.execute_shell_command("stop").await?;
        self.delete_data(device).await?;

        debug!("Syncing test files");
        let host_dir = build.data_dir();
        let data = UnixPath::new(DATA_DIR);
        for local in self.list_tests_zip_data_files(&host_dir).await? {
            if !device.sync_files(&local, data).await? {
                return Err(Error::TargetSetup(format!(
                    "failed to sync {} onto {DATA_DIR}",
                    local.display()
                )));
            }
        }

        for dir in self.find_dirs(&host_dir, data).await? {
            device
                .execute_shell_command(&format!("chown system.system {}", quoted_path(&dir)))
                .await?;
        }
        Ok(())
    }
}

fn quoted_path(path: &UnixPath) -> String {
    shell_quote(&path.display().to_string())
}
