//! Minimal Assuan client for pinentry programs.
//!
//! Only the commands needed to show one dialog and read a PIN are used:
//! `OPTION`, `SETTITLE`, `SETDESC`, `SETPROMPT`, `SETOK`, `SETCANCEL`,
//! `GETPIN` and `BYE`.
//!
//! # Security
//!
//! The PIN only ever lives in the `D` line buffer (wiped after decoding) and
//! in the returned [`SecretString`]. It is never logged.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use secrecy::SecretString;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{AdapterError, Result};
use crate::process_guard::CommandDeathPact;

/// `GPG_ERR_CANCELED`, reported when the user dismisses the dialog.
const GPG_ERR_CANCELED: u32 = 99;

/// Mask selecting the error code from an Assuan error value.
const GPG_ERR_CODE_MASK: u32 = 0xFFFF;

/// Final line of an Assuan exchange.
#[derive(Debug)]
enum Reply {
    Ok(Zeroizing<Vec<u8>>),
    Err { code: u32, message: String },
}

/// A running pinentry process.
#[derive(Debug)]
pub struct PinentryClient {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl PinentryClient {
    /// Start `program` and complete the Assuan greeting.
    pub fn open(program: &Path) -> Result<Self> {
        Self::spawn(Command::new(program))
    }

    /// Start a prepared command as the pinentry.
    pub fn spawn(mut command: Command) -> Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .with_parent_death_signal()
            .spawn()
            .map_err(|e| AdapterError::prompt(format!("failed to start {}: {}", program, e)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AdapterError::prompt("pinentry pipes unavailable"));
            }
        };

        let mut client = Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        };

        match client.read_reply()? {
            Reply::Ok(_) => debug!("pinentry {} ready", program),
            Reply::Err { message, .. } => {
                return Err(AdapterError::prompt(format!(
                    "pinentry refused the connection: {}",
                    message
                )));
            }
        }

        client.set_tty_options()?;
        Ok(client)
    }

    pub fn set_title(&mut self, title: &str) -> Result<()> {
        self.command("SETTITLE", title)
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        self.command("SETDESC", description)
    }

    pub fn set_prompt(&mut self, prompt: &str) -> Result<()> {
        self.command("SETPROMPT", prompt)
    }

    pub fn set_ok(&mut self, label: &str) -> Result<()> {
        self.command("SETOK", label)
    }

    pub fn set_cancel(&mut self, label: &str) -> Result<()> {
        self.command("SETCANCEL", label)
    }

    /// Show the dialog and wait for the user.
    pub fn get_pin(&mut self) -> Result<SecretString> {
        self.send("GETPIN")?;
        match self.read_reply()? {
            Reply::Ok(data) => {
                let pin = std::str::from_utf8(&data)
                    .map_err(|_| AdapterError::prompt("PIN is not valid UTF-8"))?;
                Ok(SecretString::new(pin.to_string()))
            }
            Reply::Err { code, .. } if code & GPG_ERR_CODE_MASK == GPG_ERR_CANCELED => {
                Err(AdapterError::PinCancelled)
            }
            Reply::Err { message, .. } => Err(AdapterError::prompt(message)),
        }
    }

    /// End the session and reap the process.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.stdin.is_some() {
            // BYE is answered with OK before pinentry exits; the reply is not needed
            if let Err(e) = self.send("BYE") {
                debug!("pinentry BYE failed: {}", e);
            }
            self.stdin = None;
        }
        self.child.wait()?;
        Ok(())
    }

    fn set_tty_options(&mut self) -> Result<()> {
        let tty = std::env::var("GPG_TTY").unwrap_or_else(|_| "/dev/tty".to_string());
        self.option("ttyname", &tty)?;
        if let Ok(term) = std::env::var("TERM") {
            self.option("ttytype", &term)?;
        }
        Ok(())
    }

    /// Options are advisory: graphical pinentries may reject tty settings.
    fn option(&mut self, name: &str, value: &str) -> Result<()> {
        self.send(&format!("OPTION {}={}", name, escape(value)))?;
        if let Reply::Err { message, .. } = self.read_reply()? {
            debug!("pinentry ignored OPTION {}: {}", name, message);
        }
        Ok(())
    }

    fn command(&mut self, verb: &str, argument: &str) -> Result<()> {
        self.send(&format!("{} {}", verb, escape(argument)))?;
        match self.read_reply()? {
            Reply::Ok(_) => Ok(()),
            Reply::Err { message, .. } => Err(AdapterError::prompt(format!(
                "{} rejected: {}",
                verb, message
            ))),
        }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AdapterError::prompt("pinentry session already closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut data = Zeroizing::new(Vec::new());
        loop {
            let mut line = Zeroizing::new(String::new());
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(AdapterError::prompt("pinentry closed the connection"));
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line == "OK" || line.starts_with("OK ") {
                return Ok(Reply::Ok(data));
            }
            if let Some(rest) = line.strip_prefix("ERR ") {
                let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let code = code.parse().unwrap_or(0);
                warn!("pinentry error {}: {}", code, message);
                return Ok(Reply::Err {
                    code,
                    message: message.to_string(),
                });
            }
            if let Some(payload) = line.strip_prefix("D ") {
                unescape_into(payload, &mut data);
                continue;
            }
            // Status ("S ..."), comments ("# ...") and inquiries are not needed here
            debug!("pinentry: skipping line starting with {:?}", line.get(..1));
        }
    }
}

impl Drop for PinentryClient {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            let _ = self.shutdown();
        }
    }
}

/// Percent-escape an Assuan command argument.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

/// Decode a percent-escaped `D` line payload, appending to `out`.
fn unescape_into(payload: &str, out: &mut Vec<u8>) {
    let bytes = payload.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
}
