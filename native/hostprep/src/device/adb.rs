use std::{
    error::Error as StdError,
    path::Path,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, anyhow, bail, ensure};
use async_trait::async_trait;
use derive_more::Debug;
use forensic_adb::{Device, DeviceError, DeviceState, Host, UnixFileStatus, UnixPath, UnixPathBuf};
use lazy_regex::{Lazy, Regex, lazy_regex};
use tokio::{
    fs::File,
    io::BufReader,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{DEVICE_TMP_DIR, RecoveryMode, TestDevice, shell_quote};
use crate::{
    Error, Result,
    instrumentation::{InstrumentationRun, TestRunResult, parse_instrumentation_output},
    package::MAX_WAIT_FOR_DEVICE_TIME,
};

/// [`TestDevice`] backed by an adb connection
#[derive(Debug)]
pub struct AdbDevice {
    #[debug(skip)]
    inner: Device,
    /// Unique device serial number as reported by adb
    serial: String,
    recovery_mode: Mutex<RecoveryMode>,
    /// How long recovery waits for a lost device before giving up
    recovery_timeout: Duration,
}

impl AdbDevice {
    const POLL_STEP: Duration = Duration::from_millis(500);

    /// Connects to the device with the given serial, or to the first online device
    #[instrument(level = "debug", skip(host), err)]
    pub async fn connect(host: Host, serial: Option<&str>) -> anyhow::Result<Self> {
        let devices = host
            .devices::<Vec<_>>()
            .await
            .context("Failed to list adb devices")?
            .into_iter()
            .filter(|d| d.state == DeviceState::Device)
            .collect::<Vec<_>>();

        let brief = match serial {
            Some(serial) => devices
                .iter()
                .find(|d| d.serial == serial)
                .with_context(|| format!("Device {serial} is not connected"))?,
            None => devices.first().context("No available device found")?,
        };
        info!(serial = %brief.serial, "Found device, connecting...");

        let inner = Device::new(host, brief.serial.clone(), brief.info.clone())
            .await
            .context("Failed to connect to device")?;
        Ok(Self::new(inner))
    }

    pub fn new(inner: Device) -> Self {
        let serial = inner.serial.clone();
        Self {
            inner,
            serial,
            recovery_mode: Mutex::new(RecoveryMode::default()),
            recovery_timeout: MAX_WAIT_FOR_DEVICE_TIME,
        }
    }

    pub fn with_recovery_timeout(mut self, recovery_timeout: Duration) -> Self {
        self.recovery_timeout = recovery_timeout;
        self
    }

    /// Classifies `error` and, if the device is gone, lets the recovery mode wait for it
    /// before the error is handed back
    async fn surface(&self, error: anyhow::Error) -> Error {
        let error = classify(&self.serial, error);
        let Some(mode) = recovery_target(self.recovery_mode(), &error) else {
            return error;
        };

        warn!(serial = %self.serial, ?mode, "Device lost, waiting for it to come back");
        let recovered = match mode {
            RecoveryMode::Online => self.wait_until_online(self.recovery_timeout).await,
            _ => self.wait_until_available(self.recovery_timeout).await,
        };
        match recovered {
            Ok(()) => info!(serial = %self.serial, ?mode, "Device recovered"),
            Err(e) => error!(
                error = e.as_ref() as &dyn StdError,
                serial = %self.serial,
                "Device did not recover"
            ),
        }
        error
    }

    async fn guard<T>(&self, result: anyhow::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.surface(e).await),
        }
    }

    /// `Ok(false)` for a refused write, `Err` once the device is gone
    async fn soft(&self, result: anyhow::Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) => soft_failure(self.surface(e).await),
        }
    }

    /// Executes a shell command on the device
    #[instrument(level = "debug", skip(self), err, ret)]
    async fn shell(&self, command: &str) -> anyhow::Result<String> {
        self.inner
            .execute_host_shell_command(command)
            .await
            .context("Failed to execute shell command")
            .inspect(|v| trace!(output = ?v, "Shell command executed"))
    }

    /// Executes a shell command and fails if exit code is non-zero.
    #[instrument(level = "debug", skip(self), err, ret)]
    async fn shell_checked(&self, command: &str) -> anyhow::Result<String> {
        let shell_output = self
            .shell(&format!("{} ; printf '\\n%s' $?", command))
            .await
            .context(format!("Failed to execute checked shell command: {command}"))?;
        check_exit_code(command, &shell_output)
    }

    /// Resolves the effective remote destination path for a push operation.
    ///
    /// If `dest` is an existing directory the source name is appended. Pushing a directory
    /// over an existing file is rejected, and a destination whose parent is missing is an error.
    #[instrument(level = "debug", skip(self), ret, err)]
    async fn resolve_push_dest_path(
        &self,
        source: &Path,
        dest: &UnixPath,
    ) -> anyhow::Result<UnixPathBuf> {
        let source_name = source
            .file_name()
            .context("Source path has no file name")?
            .to_str()
            .context("Source file name is not valid UTF-8")?;

        if let Ok(stat) = self.inner.stat(dest).await {
            if stat.file_mode == UnixFileStatus::Directory {
                Ok(UnixPathBuf::from(dest).join(source_name))
            } else if source.is_dir() {
                bail!(
                    "Cannot push directory '{}' to existing file '{}'",
                    source.display(),
                    dest.display()
                )
            } else {
                Ok(UnixPathBuf::from(dest))
            }
        } else if let Some(parent) = dest.parent() {
            if self.inner.stat(parent).await.is_ok() {
                Ok(UnixPathBuf::from(dest))
            } else {
                bail!("Parent directory '{}' does not exist", parent.display())
            }
        } else {
            bail!("Invalid destination path: no parent directory")
        }
    }

    /// Pushes a file to the device and returns where it landed
    #[instrument(level = "debug", skip(self), err)]
    async fn push(&self, source_file: &Path, dest: &UnixPath) -> anyhow::Result<UnixPathBuf> {
        ensure!(
            source_file.is_file(),
            "Path does not exist or is not a file: {}",
            source_file.display()
        );

        let dest_path = self.resolve_push_dest_path(source_file, dest).await?;
        debug!(source = %source_file.display(), dest = %dest_path.display(), "Pushing file");
        let mut file = BufReader::new(File::open(source_file).await?);
        self.inner.push(&mut file, &dest_path, 0o777).await.context("Failed to push file")?;
        Ok(dest_path)
    }

    /// Pushes a directory into `dest`
    #[instrument(level = "debug", skip(self), err)]
    async fn push_dir(&self, source: &Path, dest: &UnixPath) -> anyhow::Result<()> {
        ensure!(
            source.is_dir(),
            "Source path does not exist or is not a directory: {}",
            source.display()
        );

        let dest_path = self.resolve_push_dest_path(source, dest).await?;
        debug!(source = %source.display(), dest = %dest_path.display(), "Pushing directory");
        self.inner.push_dir(source, &dest_path, 0o777).await.context("Failed to push directory")
    }

    /// Pushes raw bytes to a file on the device
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()), err)]
    async fn push_bytes(&self, mut bytes: &[u8], remote_path: &UnixPath) -> anyhow::Result<()> {
        self.inner.push(&mut bytes, remote_path, 0o777).await.context("Failed to push bytes")
    }

    /// Returns true once the device reports boot completion and a responsive package manager
    async fn is_available(&self) -> anyhow::Result<bool> {
        let boot_completed = self.shell("getprop sys.boot_completed").await?;
        if boot_completed.trim() != "1" {
            return Ok(false);
        }
        let pm_output = self.shell("pm path android").await?;
        Ok(pm_output.contains("package:"))
    }

    /// Polls until the device is fully usable. A hung check counts against `limit` too.
    #[instrument(level = "debug", skip(self), err)]
    async fn wait_until_available(&self, limit: Duration) -> anyhow::Result<()> {
        poll_until(limit, Self::POLL_STEP, move || self.is_available())
            .await
            .context("Device did not become available")
    }

    /// Polls the adb server until it lists the device as online again
    #[instrument(level = "debug", skip(self), err)]
    async fn wait_until_online(&self, limit: Duration) -> anyhow::Result<()> {
        poll_until(limit, Self::POLL_STEP, move || async move {
            let devices =
                self.inner.host.devices::<Vec<_>>().await.context("Failed to list adb devices")?;
            anyhow::Ok(
                devices.iter().any(|d| d.serial == self.serial && d.state == DeviceState::Device),
            )
        })
        .await
        .context("Device did not come back online")
    }

    #[instrument(level = "debug", skip(self, apk), err)]
    async fn install(
        &self,
        apk: &Path,
        replace: bool,
        extra_args: &[&str],
    ) -> anyhow::Result<Option<String>> {
        info!(path = %apk.display(), "Installing APK");
        let remote_apk = self
            .push(apk, UnixPath::new(DEVICE_TMP_DIR))
            .await
            .context("Failed to stage APK on device")?;
        let remote_apk = shell_quote(&remote_apk.display().to_string());

        let mut command = String::from("pm install");
        if replace {
            command.push_str(" -r");
        }
        for arg in extra_args {
            command.push(' ');
            command.push_str(arg);
        }
        command.push(' ');
        command.push_str(&remote_apk);
        let output = self.shell(&command).await.context("'pm install' command failed")?;

        if let Err(e) = self.shell(&format!("rm -f {remote_apk}")).await {
            warn!(
                error = e.as_ref() as &dyn StdError,
                path = %remote_apk,
                "Failed to remove staged APK"
            );
        }
        Ok(parse_pm_result(&output))
    }
}

#[async_trait]
impl TestDevice for AdbDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    async fn install_package(
        &self,
        apk: &Path,
        replace: bool,
        extra_args: &[&str],
    ) -> Result<Option<String>> {
        let result = self.install(apk, replace, extra_args).await;
        self.guard(result).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn uninstall_package(&self, package: &str) -> Result<Option<String>> {
        let output = self
            .shell(&format!("pm uninstall {}", shell_quote(package)))
            .await
            .context("'pm uninstall' command failed");
        Ok(parse_pm_result(&self.guard(output).await?))
    }

    async fn execute_shell_command(&self, command: &str) -> Result<String> {
        let output = self.shell(command).await;
        self.guard(output).await
    }

    async fn push_string(&self, content: &str, remote_path: &UnixPath) -> Result<bool> {
        let result = self.push_bytes(content.as_bytes(), remote_path).await;
        self.soft(result).await
    }

    #[instrument(level = "debug", skip(self), err, ret)]
    async fn does_file_exist(&self, remote_path: &UnixPath) -> Result<bool> {
        let output = self
            .shell(&format!(
                "ls -d {} > /dev/null 2>&1 ; echo $?",
                shell_quote(&remote_path.display().to_string())
            ))
            .await;
        Ok(self.guard(output).await?.trim() == "0")
    }

    async fn sync_files(&self, local_dir: &Path, remote_dir: &UnixPath) -> Result<bool> {
        let result = self.push_dir(local_dir, remote_dir).await;
        self.soft(result).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn wait_for_device_available(&self, timeout: Duration) -> Result<()> {
        self.wait_until_available(timeout)
            .await
            .map_err(|e| Error::device_unavailable(&self.serial, e))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn list_dir(&self, remote_dir: &UnixPath) -> Result<Vec<String>> {
        let output = self
            .shell_checked(&format!("ls -a1 {}", shell_quote(&remote_dir.display().to_string())))
            .await
            .context(format!("Failed to list {}", remote_dir.display()));
        Ok(parse_ls_names(&self.guard(output).await?))
    }

    fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        debug!(?mode, serial = %self.serial, "Setting recovery mode");
        *self.recovery_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn run_instrumentation_tests(&self, run: &InstrumentationRun) -> Result<TestRunResult> {
        let output = self.shell(&run.command()).await.context("'am instrument' command failed");
        Ok(parse_instrumentation_output(&self.guard(output).await?))
    }
}

/// Runs `check` every `step` until it reports true. `limit` bounds the whole wait,
/// including a check that never returns.
pub(crate) async fn poll_until<F, Fut>(
    limit: Duration,
    step: Duration,
    mut check: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    timeout(limit, async {
        loop {
            match check().await {
                Ok(true) => return,
                Ok(false) => trace!("Device not ready yet"),
                // The device may drop off adb while booting
                Err(e) => debug!(error = e.as_ref() as &dyn StdError, "Readiness check failed"),
            }
            sleep(step).await;
        }
    })
    .await
    .with_context(|| format!("Timed out after {}s", limit.as_secs()))
}

/// adb server replies meaning the device itself is gone rather than refusing a request
static DEVICE_LOST_REGEX: Lazy<Regex> = lazy_regex!(
    r"(?i)device (offline|unauthorized|still authorizing|'[^']*' not found|not found)|no devices/emulators found|^closed$"
);

/// True when `error` means the transport to the device is lost
pub(crate) fn is_transport_loss(error: &DeviceError) -> bool {
    match error {
        DeviceError::Io(_) | DeviceError::UnknownDevice(_) => true,
        DeviceError::Adb(message) => DEVICE_LOST_REGEX.is_match(message.trim()),
        _ => false,
    }
}

/// Maps an internal error to the crate error, telling transport loss apart from
/// everything the device did answer
pub(crate) fn classify(serial: &str, error: anyhow::Error) -> Error {
    let lost = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<DeviceError>())
        .any(is_transport_loss);
    if lost { Error::device_unavailable(serial, error) } else { Error::setup(error) }
}

/// Mode to recover to after `error`, `None` when nothing should be waited for
pub(crate) fn recovery_target(mode: RecoveryMode, error: &Error) -> Option<RecoveryMode> {
    match mode {
        RecoveryMode::None => None,
        mode if error.is_device_unavailable() => Some(mode),
        _ => None,
    }
}

/// A write the device refused becomes `Ok(false)`; device loss stays an error
pub(crate) fn soft_failure(error: Error) -> Result<bool> {
    if error.is_device_unavailable() {
        return Err(error);
    }
    warn!(error = &error as &dyn StdError, "Device refused the write");
    Ok(false)
}

/// Splits output produced by `<cmd> ; printf '\n%s' $?` into the command output and its exit code
pub(crate) fn split_exit_code(shell_output: &str) -> anyhow::Result<(&str, &str)> {
    match shell_output.rsplit_once('\n') {
        Some(parts) => Ok(parts),
        None => {
            let trimmed = shell_output.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                Ok(("", trimmed))
            } else {
                Err(anyhow!("Failed to extract exit code"))
            }
        }
    }
}

/// Output of a checked command, or an error carrying its non-zero exit code
pub(crate) fn check_exit_code(command: &str, shell_output: &str) -> anyhow::Result<String> {
    let (output, exit_code) = split_exit_code(shell_output)?;
    if exit_code != "0" {
        error!(exit_code, output, "Shell command returned non-zero exit code");
        bail!("Command {command} failed with exit code {exit_code}. Output: {output}");
    }
    Ok(output.to_string())
}

/// Reads the package manager's verdict; `None` means success
pub(crate) fn parse_pm_result(output: &str) -> Option<String> {
    static FAILURE_REGEX: Lazy<Regex> = lazy_regex!(r"Failure \[(.*)\]");

    if output.lines().any(|line| line.trim() == "Success") {
        return None;
    }
    if let Some(caps) = FAILURE_REGEX.captures(output) {
        return Some(caps[1].to_string());
    }
    let trimmed = output.trim();
    Some(if trimmed.is_empty() { "Unknown failure".to_string() } else { trimmed.to_string() })
}

/// Entry names from `ls -a1`, without `.` and `..`
pub(crate) fn parse_ls_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .collect()
}
