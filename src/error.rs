//! Error handling module for the cryptsetup adapter
//!
//! Every failure in the adapter maps onto one of these variants. None of them
//! is retried: the binary prints `Got error: ...` and exits with the code
//! returned by [`AdapterError::exit_code`].

use nix::errno::Errno;
use thiserror::Error;

/// Exit status used for internal failures (device, PIN, derivation, I/O).
///
/// This is `-1` as seen by the parent shell.
pub const GENERIC_FAILURE_CODE: i32 = 255;

/// Exit status used when no subcommand was recognized or help was requested.
pub const INVALID_ARGUMENT_CODE: i32 = Errno::EINVAL as i32;

/// Main error type for the adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    /// No hardware wallet is attached
    #[error("No hardware wallet device found: {0}")]
    DeviceNotFound(String),

    /// The user cancelled the PIN (or passphrase) prompt
    #[error("PIN entry cancelled")]
    PinCancelled,

    /// The device rejected or could not complete the derivation
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),

    /// The secret prompter misbehaved (not a user cancellation)
    #[error("PIN prompt error: {0}")]
    Prompt(String),

    /// Low-level device communication failure
    #[error("Device transport error: {0}")]
    Transport(String),

    /// The wrapped tool could not be started
    #[error("Failed to launch {program}: {source}")]
    SubprocessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The wrapped tool ran but did not exit successfully
    #[error("{program} {}", describe_exit(.code, .signal))]
    SubprocessFailed {
        program: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// IO errors (pipes, terminal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(sig)) => format!("was terminated by signal {}", sig),
        (None, None) => "terminated abnormally".to_string(),
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Create a device-not-found error
    pub fn device_not_found(msg: impl Into<String>) -> Self {
        Self::DeviceNotFound(msg.into())
    }

    /// Create a derivation error
    pub fn derivation(msg: impl Into<String>) -> Self {
        Self::DerivationFailed(msg.into())
    }

    /// Create a prompt error
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Process exit status the binary should use for this error.
    ///
    /// A failed wrapped tool hands its own status through (128 + signal
    /// when it was killed). Everything else is the generic failure; usage
    /// is not an error and exits with [`INVALID_ARGUMENT_CODE`].
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SubprocessFailed {
                code: Some(code), ..
            } if *code != 0 => *code,
            Self::SubprocessFailed {
                signal: Some(sig), ..
            } => 128 + sig,
            _ => GENERIC_FAILURE_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AdapterError::derivation("Firmware error");
        assert_eq!(err.to_string(), "Key derivation failed: Firmware error");

        assert_eq!(AdapterError::PinCancelled.to_string(), "PIN entry cancelled");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AdapterError = io_err.into();
        assert!(matches!(err, AdapterError::Io(_)));
    }

    #[test]
    fn test_subprocess_failure_display() {
        let err = AdapterError::SubprocessFailed {
            program: "cryptsetup-origin".to_string(),
            code: Some(2),
            signal: None,
        };
        assert_eq!(err.to_string(), "cryptsetup-origin exited with status 2");

        let err = AdapterError::SubprocessFailed {
            program: "cryptsetup-origin".to_string(),
            code: None,
            signal: Some(9),
        };
        assert_eq!(err.to_string(), "cryptsetup-origin was terminated by signal 9");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(INVALID_ARGUMENT_CODE, 22);
        assert_eq!(AdapterError::PinCancelled.exit_code(), GENERIC_FAILURE_CODE);
        assert_eq!(
            AdapterError::device_not_found("none").exit_code(),
            GENERIC_FAILURE_CODE
        );
        assert_eq!(
            AdapterError::SubprocessFailed {
                program: "x".to_string(),
                code: Some(5),
                signal: None,
            }
            .exit_code(),
            5
        );
        assert_eq!(
            AdapterError::SubprocessFailed {
                program: "x".to_string(),
                code: None,
                signal: Some(15),
            }
            .exit_code(),
            143
        );
        let launch = AdapterError::SubprocessLaunch {
            program: "x".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(launch.exit_code(), GENERIC_FAILURE_CODE);
    }
}
