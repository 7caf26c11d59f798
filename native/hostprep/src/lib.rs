//! Host-side helpers that prepare an Android device for a test run.
//!
//! [`PackageVerifier`] installs APKs and checks where the package manager put them.
//! [`TestsZipInstaller`] wipes `/data` and stages the `DATA` payload of a tests build
//! onto it. Both drive a [`TestDevice`]; [`AdbDevice`] is the adb-backed one.

pub mod config;
pub mod device;
mod error;
pub mod instrumentation;
pub mod logging;
pub mod package;
pub mod tests_zip;

pub use config::HarnessConfig;
pub use device::{AdbDevice, RecoveryMode, TestDevice};
pub use error::{Error, Result};
pub use instrumentation::{InstrumentationRun, TestMethod, TestRunResult};
pub use package::{InstallLocPreference, InstallLocation, PackageVerifier};
pub use tests_zip::{Backoff, DeviceBuildInfo, RetryPolicy, TestsZipInstaller};
