use std::fmt::Display;

/// Errors surfaced by the preparation helpers.
///
/// Every variant propagates to the caller untouched; nothing in this crate retries
/// on [`Error::DeviceUnavailable`] or downgrades a failed check.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Communication with the device was lost. Fatal for the current operation.
    #[error("device {serial} is not available")]
    DeviceUnavailable {
        serial: String,
        #[source]
        source: anyhow::Error,
    },

    /// A precondition for continuing could not be established on the device.
    #[error("target setup failed: {0}")]
    TargetSetup(String),

    /// An expected-vs-actual check on the device state did not hold.
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("invalid configuration: {0:#}")]
    Config(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn device_unavailable(serial: impl Into<String>, source: anyhow::Error) -> Self {
        Self::DeviceUnavailable { serial: serial.into(), source }
    }

    pub fn target_setup(message: impl Display) -> Self {
        Self::TargetSetup(message.to_string())
    }

    /// Setup error carrying the full context chain of `error`
    pub(crate) fn setup(error: anyhow::Error) -> Self {
        Self::TargetSetup(format!("{error:#}"))
    }

    /// True for errors the caller must treat as unretryable loss of the device
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

/// Fails with [`Error::Verification`] when `condition` does not hold.
pub(crate) fn verify(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition { Ok(()) } else { Err(Error::Verification(message())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_passes_through_true_condition() {
        assert!(verify(true, || unreachable!()).is_ok());
    }

    #[test]
    fn verify_reports_message() {
        let err = verify(false, || "package com.example missing".to_string()).unwrap_err();
        assert!(matches!(err, Error::Verification(ref m) if m == "package com.example missing"));
        assert_eq!(err.to_string(), "verification failed: package com.example missing");
    }

    #[test]
    fn device_unavailable_keeps_source() {
        let err = Error::device_unavailable("emulator-5554", anyhow::anyhow!("connection reset"));
        assert!(err.is_device_unavailable());
        assert_eq!(err.to_string(), "device emulator-5554 is not available");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "connection reset");
    }
}
