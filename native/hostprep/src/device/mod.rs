mod adb;
#[cfg(test)]
pub(crate) mod fake;

use std::{path::Path, time::Duration};

pub use adb::AdbDevice;
use async_trait::async_trait;
pub use forensic_adb::{UnixPath, UnixPathBuf};

use crate::{
    Result,
    instrumentation::{InstrumentationRun, TestRunResult},
};

/// Scratch directory on the device that stays writable for the shell user
pub const DEVICE_TMP_DIR: &str = "/data/local/tmp";

/// Quotes `arg` for the device shell, leaving plain words untouched
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "._-#/:=,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// How the device layer reacts when it notices the device went away mid-operation.
///
/// The failed operation is never retried; recovery only waits for the device to come
/// back before the [`crate::Error::DeviceUnavailable`] is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Don't attempt recovery
    None,
    /// Recover only to the point where adb sees the device online
    Online,
    /// Recover until the device is fully available (booted, package manager up)
    #[default]
    Available,
}

/// The device-communication collaborator the helpers drive.
///
/// Every method is a single round trip. Implementations report a lost device as
/// [`crate::Error::DeviceUnavailable`], after waiting for it as the [`RecoveryMode`] says;
/// anything the device answered is returned as data.
#[async_trait]
pub trait TestDevice: Send + Sync {
    /// Serial number used in logs and error messages
    fn serial_number(&self) -> &str;

    /// Installs an APK. Returns the package manager's error string, `None` on success.
    async fn install_package(
        &self,
        apk: &Path,
        replace: bool,
        extra_args: &[&str],
    ) -> Result<Option<String>>;

    /// Uninstalls a package. Returns the package manager's error string, `None` on success.
    async fn uninstall_package(&self, package: &str) -> Result<Option<String>>;

    /// Runs a shell command and returns its stdout
    async fn execute_shell_command(&self, command: &str) -> Result<String>;

    /// Writes `content` to a file on the device. `false` when the write did not happen.
    async fn push_string(&self, content: &str, remote_path: &UnixPath) -> Result<bool>;

    async fn does_file_exist(&self, remote_path: &UnixPath) -> Result<bool>;

    /// Pushes the local directory `local_dir` into `remote_dir`
    async fn sync_files(&self, local_dir: &Path, remote_dir: &UnixPath) -> Result<bool>;

    /// Blocks until the device is fully usable or `timeout` elapses
    async fn wait_for_device_available(&self, timeout: Duration) -> Result<()>;

    /// Names of the entries directly under `remote_dir`
    async fn list_dir(&self, remote_dir: &UnixPath) -> Result<Vec<String>>;

    fn recovery_mode(&self) -> RecoveryMode;

    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Executes an instrumentation run and collects its per-test results
    async fn run_instrumentation_tests(&self, run: &InstrumentationRun) -> Result<TestRunResult>;
}
