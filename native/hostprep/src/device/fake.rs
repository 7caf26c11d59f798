//! Scripted in-memory [`TestDevice`] for unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use super::{RecoveryMode, TestDevice, UnixPath};
use crate::{
    Error, Result,
    instrumentation::{InstrumentationRun, TestRunResult, parse_instrumentation_output},
    package::APP_PRIVATE_PATH,
};

/// One interaction with the device, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Install { apk: PathBuf, replace: bool, extra_args: Vec<String> },
    Uninstall(String),
    Shell(String),
    PushString(String),
    DoesFileExist(String),
    Sync { local: PathBuf, remote: String },
    WaitForAvailable(Duration),
    ListDir(String),
    SetRecoveryMode(RecoveryMode),
    Instrument(String),
}

/// An APK file the fake knows how to "install"
#[derive(Debug, Clone)]
struct ApkStub {
    package: String,
    /// Root the package lands under on a normal install
    root: String,
    install_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    recovery_mode: RecoveryMode,
    shell_outputs: Vec<(String, String)>,
    apks: HashMap<PathBuf, ApkStub>,
    /// package -> root it is installed under
    installed: BTreeMap<String, String>,
    dirs: HashMap<String, Vec<String>>,
    /// path -> number of existence checks that still report the path present
    lingering: HashMap<String, u32>,
    push_string_fails: bool,
    sync_fails: bool,
    unavailable: bool,
    instrumentation_output: String,
}

#[derive(Debug)]
pub(crate) struct FakeDevice {
    serial: String,
    state: Mutex<State>,
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        Self { serial: "fake-serial".to_string(), state: Mutex::new(State::default()) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Output for shell commands starting with `prefix`
    pub(crate) fn with_shell_output(self, prefix: &str, output: &str) -> Self {
        self.state().shell_outputs.push((prefix.to_string(), output.to_string()));
        self
    }

    pub(crate) fn with_apk(self, apk: &Path, package: &str, root: &str) -> Self {
        self.state().apks.insert(apk.to_path_buf(), ApkStub {
            package: package.to_string(),
            root: root.to_string(),
            install_error: None,
        });
        self
    }

    pub(crate) fn with_failing_apk(self, apk: &Path, package: &str, error: &str) -> Self {
        self.state().apks.insert(apk.to_path_buf(), ApkStub {
            package: package.to_string(),
            root: String::new(),
            install_error: Some(error.to_string()),
        });
        self
    }

    pub(crate) fn with_installed(self, package: &str, root: &str) -> Self {
        self.state().installed.insert(package.to_string(), root.to_string());
        self
    }

    pub(crate) fn with_dir(self, path: &str, entries: &[&str]) -> Self {
        self.state()
            .dirs
            .insert(path.to_string(), entries.iter().map(|e| e.to_string()).collect());
        self
    }

    /// `path` keeps existing for the next `checks` existence checks
    pub(crate) fn with_lingering_path(self, path: &str, checks: u32) -> Self {
        self.state().lingering.insert(path.to_string(), checks);
        self
    }

    pub(crate) fn with_read_only_filesystem(self) -> Self {
        self.state().push_string_fails = true;
        self
    }

    pub(crate) fn with_failing_sync(self) -> Self {
        self.state().sync_fails = true;
        self
    }

    pub(crate) fn with_recovery_mode(self, mode: RecoveryMode) -> Self {
        self.state().recovery_mode = mode;
        self
    }

    /// Every device call fails as if the device dropped off
    pub(crate) fn unavailable(self) -> Self {
        self.state().unavailable = true;
        self
    }

    pub(crate) fn with_instrumentation_output(self, output: &str) -> Self {
        self.state().instrumentation_output = output.to_string();
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Shell(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn is_installed(&self, package: &str) -> bool {
        self.state().installed.contains_key(package)
    }

    fn record(&self, call: Call) -> Result<()> {
        let mut state = self.state();
        state.calls.push(call);
        if state.unavailable {
            return Err(Error::device_unavailable(&self.serial, anyhow::anyhow!("device offline")));
        }
        Ok(())
    }
}

fn package_file_name(package: &str, root: &str) -> String {
    if root.starts_with("/mnt/secure/asec") {
        format!("{package}-1.asec")
    } else {
        format!("{package}-1.apk")
    }
}

#[async_trait]
impl TestDevice for FakeDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    async fn install_package(
        &self,
        apk: &Path,
        replace: bool,
        extra_args: &[&str],
    ) -> Result<Option<String>> {
        self.record(Call::Install {
            apk: apk.to_path_buf(),
            replace,
            extra_args: extra_args.iter().map(|a| a.to_string()).collect(),
        })?;
        let mut state = self.state();
        let Some(stub) = state.apks.get(apk).cloned() else {
            return Ok(Some("INSTALL_FAILED_INVALID_APK".to_string()));
        };
        if let Some(error) = stub.install_error {
            return Ok(Some(error));
        }
        if !replace && state.installed.contains_key(&stub.package) {
            return Ok(Some("INSTALL_FAILED_ALREADY_EXISTS".to_string()));
        }
        let root = if extra_args.contains(&"-l") { APP_PRIVATE_PATH.to_string() } else { stub.root };
        state.installed.insert(stub.package, root);
        Ok(None)
    }

    async fn uninstall_package(&self, package: &str) -> Result<Option<String>> {
        self.record(Call::Uninstall(package.to_string()))?;
        match self.state().installed.remove(package) {
            Some(_) => Ok(None),
            None => Ok(Some("DELETE_FAILED_INTERNAL_ERROR".to_string())),
        }
    }

    async fn execute_shell_command(&self, command: &str) -> Result<String> {
        self.record(Call::Shell(command.to_string()))?;
        let state = self.state();
        if let Some(package) = command.strip_prefix("pm path ") {
            return Ok(match state.installed.get(package) {
                Some(root) => format!("package:{root}{}\n", package_file_name(package, root)),
                None => String::new(),
            });
        }
        if let Some(path) = command.strip_prefix("ls ") {
            let listing = state
                .installed
                .iter()
                .filter(|(_, root)| root.as_str() == path)
                .map(|(package, root)| package_file_name(package, root))
                .collect::<Vec<_>>();
            if !listing.is_empty() {
                return Ok(listing.join("\n") + "\n");
            }
        }
        Ok(state
            .shell_outputs
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn push_string(&self, _content: &str, remote_path: &UnixPath) -> Result<bool> {
        self.record(Call::PushString(remote_path.display().to_string()))?;
        Ok(!self.state().push_string_fails)
    }

    async fn does_file_exist(&self, remote_path: &UnixPath) -> Result<bool> {
        let path = remote_path.display().to_string();
        self.record(Call::DoesFileExist(path.clone()))?;
        let mut state = self.state();
        match state.lingering.get_mut(&path) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sync_files(&self, local_dir: &Path, remote_dir: &UnixPath) -> Result<bool> {
        self.record(Call::Sync {
            local: local_dir.to_path_buf(),
            remote: remote_dir.display().to_string(),
        })?;
        Ok(!self.state().sync_fails)
    }

    async fn wait_for_device_available(&self, timeout: Duration) -> Result<()> {
        self.record(Call::WaitForAvailable(timeout))
    }

    async fn list_dir(&self, remote_dir: &UnixPath) -> Result<Vec<String>> {
        let path = remote_dir.display().to_string();
        self.record(Call::ListDir(path.clone()))?;
        Ok(self.state().dirs.get(&path).cloned().unwrap_or_default())
    }

    fn recovery_mode(&self) -> RecoveryMode {
        self.state().recovery_mode
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        let mut state = self.state();
        state.calls.push(Call::SetRecoveryMode(mode));
        state.recovery_mode = mode;
    }

    async fn run_instrumentation_tests(&self, run: &InstrumentationRun) -> Result<TestRunResult> {
        self.record(Call::Instrument(run.command()))?;
        Ok(parse_instrumentation_output(&self.state().instrumentation_output))
    }
}
