//! Package install/uninstall helpers that verify where packages end up on the device.

use std::{collections::BTreeMap, path::Path, time::Duration};

use tracing::{debug, info, instrument, warn};

use crate::{
    Error, Result,
    device::TestDevice,
    error::verify,
    instrumentation::{InstrumentationRun, TestMethod},
};

/// Where forward-locked apps live on the device
pub const APP_PRIVATE_PATH: &str = "/data/app-private/";
/// Where regular apps live on the device
pub const DEVICE_APP_PATH: &str = "/data/app/";
/// Where apps installed on removable storage live on the device
pub const SDCARD_APP_PATH: &str = "/mnt/secure/asec/";

/// Longest wait for the package manager to come back
pub const MAX_WAIT_FOR_DEVICE_TIME: Duration = Duration::from_millis(120 * 1000);

/// Flag that makes `pm install` forward-lock the package
const FORWARD_LOCK_FLAG: &str = "-l";

/// Device-wide install location preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallLocPreference {
    Auto,
    Internal,
    External,
}

impl InstallLocPreference {
    /// Value understood by `pm setInstallLocation`
    pub fn code(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Internal => 1,
            Self::External => 2,
        }
    }

    pub fn set_command(self) -> String {
        format!("pm setInstallLocation {}", self.code())
    }
}

/// Interprets `pm getInstallLocation` output.
///
/// Any `0` means [`InstallLocPreference::Auto`], otherwise any `1` means
/// [`InstallLocPreference::Internal`]; everything else, unrecognized output included,
/// is [`InstallLocPreference::External`].
pub fn parse_install_location(output: &str) -> InstallLocPreference {
    if output.contains('0') {
        InstallLocPreference::Auto
    } else if output.contains('1') {
        InstallLocPreference::Internal
    } else {
        if !output.contains('2') {
            warn!(output, "Unrecognized install location output, assuming external");
        }
        InstallLocPreference::External
    }
}

/// True if `pm path` output names at least one APK
pub fn is_package_path_output(output: &str) -> bool {
    output.contains("package:")
}

/// Where a package is expected to land after installation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallLocation {
    /// Internal storage
    Device,
    /// Removable storage
    SdCard,
    /// Internal storage, forward-locked
    ForwardLocked,
}

impl InstallLocation {
    /// Root that must list the package once installed
    pub fn expected_root(self) -> &'static str {
        match self {
            Self::Device => DEVICE_APP_PATH,
            Self::SdCard => SDCARD_APP_PATH,
            Self::ForwardLocked => APP_PRIVATE_PATH,
        }
    }

    /// Root that must not list the package once installed.
    ///
    /// Forward-locked packages keep their public resources under the regular app path,
    /// so only removable storage is excluded for them.
    pub fn excluded_root(self) -> &'static str {
        match self {
            Self::Device | Self::ForwardLocked => SDCARD_APP_PATH,
            Self::SdCard => DEVICE_APP_PATH,
        }
    }
}

/// Installs, uninstalls and queries packages, verifying the resulting device state
#[derive(Debug, Clone)]
pub struct PackageVerifier {
    package_manager_timeout: Duration,
}

impl Default for PackageVerifier {
    fn default() -> Self {
        Self { package_manager_timeout: MAX_WAIT_FOR_DEVICE_TIME }
    }
}

impl PackageVerifier {
    pub fn new(package_manager_timeout: Duration) -> Self {
        Self { package_manager_timeout }
    }

    pub fn package_manager_timeout(&self) -> Duration {
        self.package_manager_timeout
    }

    /// Installs `apk`, failing if the package manager reports any error
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn install_package<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        apk: &Path,
        replace: bool,
    ) -> Result<()> {
        match device.install_package(apk, replace, &[]).await? {
            None => Ok(()),
            Some(error) => Err(Error::TargetSetup(format!(
                "failed to install {}: {error}",
                apk.display()
            ))),
        }
    }

    /// Installs `apk` forward-locked and hands back the package manager's error, if any
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn install_package_forward_locked<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        apk: &Path,
        replace: bool,
    ) -> Result<Option<String>> {
        device.install_package(apk, replace, &[FORWARD_LOCK_FLAG]).await
    }

    /// Returns true if the package manager resolves `package` to an APK path
    #[instrument(level = "debug", skip(self, device), err, ret)]
    pub async fn package_exists<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
    ) -> Result<bool> {
        let output = device.execute_shell_command(&format!("pm path {package}")).await?;
        Ok(is_package_path_output(&output))
    }

    /// Returns true if listing `path` on the device mentions `search`
    #[instrument(level = "debug", skip(self, device), err, ret)]
    pub async fn package_located_at<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        path: &str,
        search: &str,
    ) -> Result<bool> {
        let output = device.execute_shell_command(&format!("ls {path}")).await?;
        Ok(output.contains(search))
    }

    pub async fn app_exists_on_device<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
    ) -> Result<bool> {
        self.package_located_at(device, DEVICE_APP_PATH, package).await
    }

    pub async fn app_exists_on_sd_card<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
    ) -> Result<bool> {
        self.package_located_at(device, SDCARD_APP_PATH, package).await
    }

    pub async fn app_exists_as_forward_locked<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
    ) -> Result<bool> {
        self.package_located_at(device, APP_PRIVATE_PATH, package).await
    }

    /// Blocks until the package manager responds again
    pub async fn wait_for_package_manager<D: TestDevice + ?Sized>(&self, device: &D) -> Result<()> {
        info!(
            serial = device.serial_number(),
            timeout_ms = self.package_manager_timeout.as_millis() as u64,
            "Waiting for device"
        );
        device.wait_for_device_available(self.package_manager_timeout).await
    }

    /// Installs `apk` and verifies it landed at `expected` and nowhere it shouldn't be.
    ///
    /// Without `overwrite`, any existing copy is removed first and its absence verified.
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn install_and_verify_location<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        apk: &Path,
        package: &str,
        overwrite: bool,
        expected: InstallLocation,
    ) -> Result<()> {
        if !overwrite {
            debug!(package, "Removing any existing copy before install");
            self.uninstall(device, package).await?;
        }

        match expected {
            InstallLocation::ForwardLocked => {
                let result = self.install_package_forward_locked(device, apk, overwrite).await?;
                verify(result.is_none(), || {
                    format!(
                        "forward-locked install of {} failed: {}",
                        apk.display(),
                        result.as_deref().unwrap_or_default()
                    )
                })?;
            }
            InstallLocation::Device | InstallLocation::SdCard => {
                self.install_package(device, apk, overwrite).await?;
            }
        }

        let expected_root = expected.expected_root();
        let present = self.package_located_at(device, expected_root, package).await?;
        verify(present, || format!("{package} not found under {expected_root}"))?;

        let excluded_root = expected.excluded_root();
        let misplaced = self.package_located_at(device, excluded_root, package).await?;
        verify(!misplaced, || format!("{package} unexpectedly found under {excluded_root}"))?;

        self.wait_for_package_manager(device).await?;

        let exists = self.package_exists(device, package).await?;
        verify(exists, || format!("{package} is not known to the package manager"))?;
        info!(package, ?expected, "Package installed and verified");
        Ok(())
    }

    /// Uninstalls `package` and verifies the package manager no longer knows it
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err)]
    pub async fn uninstall<D: TestDevice + ?Sized>(&self, device: &D, package: &str) -> Result<()> {
        if let Some(error) = device.uninstall_package(package).await? {
            // Uninstalling an absent package fails too; the check below decides
            debug!(package, error = %error, "Package manager reported uninstall error");
        }
        let exists = self.package_exists(device, package).await?;
        verify(!exists, || format!("{package} is still installed after uninstall"))
    }

    #[instrument(level = "debug", skip(self, device), err)]
    pub async fn set_install_location_preference<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        preference: InstallLocPreference,
    ) -> Result<()> {
        device.execute_shell_command(&preference.set_command()).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, device), err, ret)]
    pub async fn get_install_location_preference<D: TestDevice + ?Sized>(
        &self,
        device: &D,
    ) -> Result<InstallLocPreference> {
        let output = device.execute_shell_command("pm getInstallLocation").await?;
        Ok(parse_install_location(&output))
    }

    /// Runs the instrumentation tests in `package` and returns true if none failed.
    ///
    /// `method` scopes the run to a single test; `runner` defaults to
    /// [`crate::instrumentation::DEFAULT_RUNNER`]; `params` are passed to the runner as-is.
    #[instrument(level = "debug", skip(self, device), fields(serial = device.serial_number()), err, ret)]
    pub async fn run_instrumentation_tests<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
        method: Option<TestMethod>,
        runner: Option<&str>,
        params: Option<&BTreeMap<String, String>>,
    ) -> Result<bool> {
        let mut run = InstrumentationRun::new(package);
        if let Some(runner) = runner {
            run = run.with_runner(runner);
        }
        if let Some(method) = method {
            run = run.with_method(method);
        }
        for (key, value) in params.into_iter().flatten() {
            run = run.with_arg(key.as_str(), value.as_str());
        }

        let result = device.run_instrumentation_tests(&run).await?;
        if let Some(reason) = &result.run_failure {
            warn!(package, reason = %reason, "Instrumentation run did not complete");
        }
        for failed in result.failed_tests() {
            info!(test = %failed.id, status = ?failed.status, "Test failed");
        }
        Ok(!result.has_failed_tests())
    }

    /// Runs every instrumentation test in `package` with the default runner
    pub async fn run_device_tests_did_all_pass<D: TestDevice + ?Sized>(
        &self,
        device: &D,
        package: &str,
    ) -> Result<bool> {
        self.run_instrumentation_tests(device, package, None, None, None).await
    }
}
