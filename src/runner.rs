//! Wrapped tool execution
//!
//! This module is the only place the wrapped tool is launched. Its stdout
//! and stderr are the adapter's own. Its stdin is either the adapter's stdin
//! or a pipe carrying the derived key.
//!
//! # Security
//!
//! Key material never appears in the child's argv or environment. It is
//! written into an anonymous pipe, the pipe is closed, and the key buffer is
//! wiped once the child has exited (or failed to start).

use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::error::{AdapterError, Result};
use crate::process_guard::{CommandDeathPact, RegisteredChild};
use crate::wallet::DerivedKey;

/// Where the wrapped tool's stdin comes from.
#[derive(Debug)]
pub enum StdinSource {
    /// The adapter's own stdin, untouched
    Inherit,
    /// A pipe fed with the key, consumed once
    Key(DerivedKey),
}

/// Runs the wrapped tool to completion.
pub trait ToolRunner {
    /// Run with `args`, blocking until exit.
    ///
    /// A non-zero exit is [`AdapterError::SubprocessFailed`].
    fn run(&self, args: &[String], stdin: StdinSource) -> Result<()>;
}

/// [`ToolRunner`] that spawns a real process.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    program: PathBuf,
}

impl SubprocessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn check_status(&self, status: ExitStatus) -> Result<()> {
        if status.success() {
            info!("{} exited successfully", self.program_name());
            return Ok(());
        }
        info!("{} failed: {:?}", self.program_name(), status);
        Err(AdapterError::SubprocessFailed {
            program: self.program_name(),
            code: status.code(),
            signal: status.signal(),
        })
    }
}

impl ToolRunner for SubprocessRunner {
    fn run(&self, args: &[String], stdin: StdinSource) -> Result<()> {
        // Args never hold key material, so they are safe to log
        info!("Running: {} {:?}", self.program_name(), args);

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .with_parent_death_signal();
        match stdin {
            StdinSource::Inherit => cmd.stdin(Stdio::inherit()),
            StdinSource::Key(_) => cmd.stdin(Stdio::piped()),
        };

        // `stdin` (and with it the key) is dropped on every return below
        let mut child = cmd.spawn().map_err(|source| AdapterError::SubprocessLaunch {
            program: self.program_name(),
            source,
        })?;
        let _registered = RegisteredChild::new(child.id());

        let mut write_error = None;
        if let StdinSource::Key(key) = &stdin {
            if let Some(mut pipe) = child.stdin.take() {
                debug!("Writing {} key bytes to {}", key.len(), self.program_name());
                match io::copy(&mut key.reader(), &mut pipe).and_then(|_| pipe.flush()) {
                    Ok(()) => {}
                    // The tool may exit before reading (bad arguments, wrong device)
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("{} closed stdin before reading the key", self.program_name());
                    }
                    Err(e) => write_error = Some(e),
                }
                // Dropping the pipe delivers EOF
            }
        }

        let status = child.wait()?;
        drop(stdin);

        if let Some(e) = write_error {
            warn!("Failed to hand the key to {}: {}", self.program_name(), e);
            self.check_status(status)?;
            return Err(e.into());
        }
        self.check_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_success() {
        let runner = SubprocessRunner::new("sh");
        runner
            .run(&args(&["-c", "exit 0"]), StdinSource::Inherit)
            .unwrap();
    }

    #[test]
    fn test_exit_code_reported() {
        let runner = SubprocessRunner::new("sh");
        let err = runner
            .run(&args(&["-c", "exit 4"]), StdinSource::Inherit)
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::SubprocessFailed { code: Some(4), .. }
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_launch_failure() {
        let runner = SubprocessRunner::new("/nonexistent/cryptsetup-origin");
        let err = runner
            .run(&[], StdinSource::Key(DerivedKey::new(vec![1, 2, 3])))
            .unwrap_err();
        assert!(matches!(err, AdapterError::SubprocessLaunch { .. }));
    }

    #[test]
    fn test_child_ignoring_stdin_is_not_a_write_error() {
        let runner = SubprocessRunner::new("sh");
        let err = runner
            .run(
                &args(&["-c", "exec 0<&-; exit 2"]),
                StdinSource::Key(DerivedKey::new(vec![0u8; 32])),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::SubprocessFailed { code: Some(2), .. }
        ));
    }
}
