use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use forensic_adb::Host;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use tracing_appender::non_blocking::WorkerGuard;

use crate::{
    Error, Result,
    device::AdbDevice,
    logging,
    package::{MAX_WAIT_FOR_DEVICE_TIME, PackageVerifier},
    tests_zip::{Backoff, DEFAULT_RM_ATTEMPTS, RetryPolicy, TestsZipInstaller},
};

const CONFIG_FILE_NAME: &str = "config.json";

/// Harness configuration, stored as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// adb server host, `None` for the forensic-adb default
    pub adb_host: Option<String>,
    pub adb_port: Option<u16>,
    /// Device to prepare; the first online device when unset
    pub serial: Option<String>,
    pub package_manager_timeout_ms: u64,
    /// Entries under `/data` that survive a wipe
    pub data_skip_list: BTreeSet<String>,
    pub rm_attempts: u32,
    /// Pause between removal attempts, `0` to retry immediately
    pub rm_retry_delay_ms: u64,
    pub logs_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            adb_host: None,
            adb_port: None,
            serial: None,
            package_manager_timeout_ms: MAX_WAIT_FOR_DEVICE_TIME.as_millis() as u64,
            data_skip_list: BTreeSet::new(),
            rm_attempts: DEFAULT_RM_ATTEMPTS,
            rm_retry_delay_ms: 0,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl HarnessConfig {
    /// `<config dir>/hostprep/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hostprep").join(CONFIG_FILE_NAME))
    }

    /// Loads the config at `path`, falling back to defaults when the file doesn't exist
    #[instrument(level = "debug", err)]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file doesn't exist, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading config from file");
        let content = fs::read_to_string(path)
            .context("Failed to read config file")
            .map_err(Error::Config)?;
        let config: Self = serde_json::from_str(&content)
            .context("Failed to parse config file")
            .map_err(Error::Config)?;
        debug!(?config, "Loaded config");
        Ok(config)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")
            .map_err(Error::Config)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            info!(path = %parent.display(), "Creating config directory");
            fs::create_dir_all(parent)
                .context("Failed to create config directory")
                .map_err(Error::Config)?;
        }
        fs::write(path, json).context("Failed to write config file").map_err(Error::Config)?;
        info!(path = %path.display(), "Saved config");
        Ok(())
    }

    pub fn adb_host(&self) -> Host {
        Host { host: self.adb_host.clone(), port: self.adb_port }
    }

    /// Connects to the configured device, or the first online one when no serial is set.
    ///
    /// Recovery after device loss waits as long as the package manager timeout.
    pub async fn connect(&self) -> Result<AdbDevice> {
        let device = AdbDevice::connect(self.adb_host(), self.serial.as_deref())
            .await
            .map_err(|e| Error::device_unavailable(self.serial.as_deref().unwrap_or("<any>"), e))?;
        Ok(device.with_recovery_timeout(self.package_manager_timeout()))
    }

    /// Starts logging into [`HarnessConfig::logs_dir`]
    pub fn setup_logging(&self) -> anyhow::Result<WorkerGuard> {
        logging::setup_logging(&self.logs_dir)
    }

    pub fn package_manager_timeout(&self) -> Duration {
        Duration::from_millis(self.package_manager_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = match self.rm_retry_delay_ms {
            0 => Backoff::None,
            ms => Backoff::Fixed(Duration::from_millis(ms)),
        };
        RetryPolicy { max_attempts: self.rm_attempts, backoff }
    }

    pub fn package_verifier(&self) -> PackageVerifier {
        PackageVerifier::new(self.package_manager_timeout())
    }

    pub fn tests_zip_installer(&self) -> TestsZipInstaller {
        TestsZipInstaller::new(self.data_skip_list.iter().cloned())
            .with_retry_policy(self.retry_policy())
    }
}
