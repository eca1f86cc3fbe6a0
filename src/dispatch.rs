//! Command dispatch
//!
//! Decides what an invocation needs and carries it out:
//!
//! | Invocation                      | Action                                          |
//! |---------------------------------|-------------------------------------------------|
//! | help flag, or no `luks*` arg    | usage + wrapped tool's `--help`, EINVAL exit    |
//! | key-requiring `luks*` command   | device key, `--key-file -` prepended, key stdin |
//! | any other `luks*` command       | forwarded verbatim with the adapter's stdin     |
//!
//! A failed key request ends the run. There is no fallback to the wrapped
//! tool's own passphrase prompt.

use std::io::Write;

use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{debug, info, warn};

use crate::config::{DerivationConstants, KEY_FILE_ARGS, LUKS_TYPE_OPTIONS, SUBCOMMAND_PREFIX};
use crate::error::Result;
use crate::key_request::request_key;
use crate::prompt::SecretPrompter;
use crate::runner::{StdinSource, ToolRunner};
use crate::wallet::WalletConnector;

/// Notice shown before the device is contacted.
pub const DEVICE_NOTICE: &str =
    "Sent the request to the Trezor device (please confirm the operation if required)";

/// Subcommands that open or modify key slots and therefore need the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString, EnumIter)]
pub enum KeyedCommand {
    #[strum(serialize = "luksOpen")]
    Open,
    #[strum(serialize = "luksFormat")]
    Format,
    #[strum(serialize = "luksDump")]
    Dump,
    #[strum(serialize = "luksResume")]
    Resume,
    #[strum(serialize = "luksAddKey")]
    AddKey,
    #[strum(serialize = "luksChangeKey")]
    ChangeKey,
}

/// What one invocation will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Print usage and the wrapped tool's help
    Usage,
    /// Forward `args` verbatim
    PassThrough { args: Vec<String> },
    /// Obtain the key, then run `args` with it on stdin
    KeyRequired {
        command: KeyedCommand,
        args: Vec<String>,
    },
}

impl Invocation {
    /// Classify the wrapped tool's argument list.
    pub fn classify(args: Vec<String>, help: bool) -> Self {
        if help {
            return Self::Usage;
        }
        let Some(subcommand) = find_subcommand(&args) else {
            return Self::Usage;
        };
        match subcommand.parse::<KeyedCommand>() {
            Ok(command) => Self::KeyRequired { command, args },
            Err(_) => Self::PassThrough { args },
        }
    }
}

/// First argument naming a LUKS subcommand.
pub fn find_subcommand(args: &[String]) -> Option<&str> {
    let mut previous: Option<&str> = None;
    for arg in args.iter().map(String::as_str) {
        if arg.starts_with(SUBCOMMAND_PREFIX) && !is_luks_type_value(previous) {
            return Some(arg);
        }
        previous = Some(arg);
    }
    None
}

/// Whether the argument after `previous` is the value of `--type`/`-M`.
pub fn is_luks_type_value(previous: Option<&str>) -> bool {
    previous.is_some_and(|prev| LUKS_TYPE_OPTIONS.contains(&prev))
}

/// Argument list with the read-key-from-stdin flag in front.
pub fn with_key_file_args(args: &[String]) -> Vec<String> {
    KEY_FILE_ARGS
        .iter()
        .map(|s| s.to_string())
        .chain(args.iter().cloned())
        .collect()
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The wrapped tool ran and succeeded
    Finished,
    /// Usage was printed; the caller exits with the invalid-argument status
    UsageShown,
}

/// Carries out [`Invocation`]s against the collaborators it was built with.
pub struct Dispatcher<'a> {
    pub connector: &'a dyn WalletConnector,
    pub prompter: &'a mut dyn SecretPrompter,
    pub runner: &'a dyn ToolRunner,
    pub console: &'a mut dyn Write,
    pub constants: DerivationConstants,
    pub key_name: String,
    /// The adapter's own usage text
    pub usage: String,
}

impl Dispatcher<'_> {
    pub fn dispatch(&mut self, invocation: Invocation) -> Result<Completion> {
        match invocation {
            Invocation::Usage => {
                debug!("No LUKS subcommand or help requested, showing usage");
                writeln!(self.console, "{}", self.usage.trim_end())?;
                self.console.flush()?;
                // The exit status is EINVAL whatever the wrapped help does
                if let Err(e) = self.runner.run(&["--help".to_string()], StdinSource::Inherit) {
                    warn!("Wrapped tool help failed: {}", e);
                }
                Ok(Completion::UsageShown)
            }
            Invocation::PassThrough { args } => {
                debug!("Forwarding without a key");
                self.runner.run(&args, StdinSource::Inherit)?;
                Ok(Completion::Finished)
            }
            Invocation::KeyRequired { command, args } => {
                info!("{} needs the device key", command);
                writeln!(self.console, "{}", DEVICE_NOTICE)?;
                self.console.flush()?;

                let key = request_key(
                    self.connector,
                    &mut *self.prompter,
                    &self.constants,
                    &self.key_name,
                )?;
                self.runner
                    .run(&with_key_file_args(&args), StdinSource::Key(key))?;
                Ok(Completion::Finished)
            }
        }
    }
}
