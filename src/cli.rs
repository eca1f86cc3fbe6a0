use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::{
    AdapterConfig, DEFAULT_KEY_NAME, DEFAULT_PINENTRY, DEFAULT_WRAPPED_TOOL, PINENTRY_ENV,
    SUBCOMMAND_PREFIX, WRAPPED_TOOL_ENV,
};
use crate::dispatch::is_luks_type_value;

const KEY_NAME_FLAG: &str = "--trezor-key-name";

/// cryptsetup wrapper that unlocks LUKS volumes with a key derived on a Trezor
///
/// For luksOpen, luksFormat, luksDump, luksResume, luksAddKey and luksChangeKey
/// the key is requested from the hardware wallet and passed to the real
/// cryptsetup on stdin. Every other command is forwarded unchanged.
#[derive(Parser, Debug)]
#[command(name = "cryptsetup")]
#[command(disable_help_flag = true, disable_version_flag = true, args_override_self = true)]
#[command(override_usage = "cryptsetup [--trezor-key-name=<NAME>] [cryptsetup options] <luksCommand> [args]")]
pub struct Cli {
    /// Print this help message and the wrapped cryptsetup's help
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    /// Name of the key to request from the Trezor
    #[arg(long = "trezor-key-name", value_name = "NAME", default_value = DEFAULT_KEY_NAME)]
    pub trezor_key_name: String,

    /// Arguments for cryptsetup, forwarded as given
    #[arg(skip)]
    pub args: Vec<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::try_parse_args(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    /// Parse a full argument vector, program name first.
    ///
    /// The adapter's own flags are picked out of the arguments that come
    /// before the LUKS subcommand (or a `--`); clap only ever sees those.
    /// Everything else is kept, in order, for the wrapped tool.
    pub fn try_parse_args<I, T>(argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let argv = argv
            .into_iter()
            .map(|arg| {
                arg.into()
                    .into_string()
                    .map_err(|_| clap::Error::new(ErrorKind::InvalidUtf8))
            })
            .collect::<Result<Vec<String>, _>>()?;

        let (adapter, forwarded) = split_adapter_args(argv);
        let mut cli = Self::try_parse_from(adapter)?;
        cli.args = forwarded;
        Ok(cli)
    }

    /// Runtime settings for this invocation.
    ///
    /// The wrapped tool and pinentry come from the environment so that no
    /// flag beyond `--help` and `--trezor-key-name` is taken away from
    /// cryptsetup.
    pub fn config(&self) -> AdapterConfig {
        self.config_from_env(|name| std::env::var_os(name))
    }

    fn config_from_env(&self, lookup: impl Fn(&str) -> Option<OsString>) -> AdapterConfig {
        AdapterConfig {
            wrapped_tool: lookup(WRAPPED_TOOL_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WRAPPED_TOOL)),
            pinentry: lookup(PINENTRY_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PINENTRY)),
            key_name: self.trezor_key_name.clone(),
        }
    }

    /// The adapter's own usage text.
    pub fn usage() -> String {
        Self::command().render_help().to_string()
    }
}

/// Split `argv` into the adapter's arguments (program name included) and
/// the wrapped tool's.
fn split_adapter_args(argv: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut iter = argv.into_iter();
    let mut adapter: Vec<String> = iter.next().into_iter().collect();
    let mut forwarded = Vec::new();

    while let Some(arg) = iter.next() {
        if is_luks_type_value(forwarded.last().map(String::as_str)) {
            forwarded.push(arg);
            continue;
        }
        if arg.starts_with(SUBCOMMAND_PREFIX) || arg == "--" {
            forwarded.push(arg);
            break;
        }
        let takes_value = arg == KEY_NAME_FLAG;
        if takes_value || is_adapter_switch(&arg) {
            adapter.push(arg);
            if takes_value {
                adapter.extend(iter.next());
            }
        } else {
            forwarded.push(arg);
        }
    }
    forwarded.extend(iter);
    (adapter, forwarded)
}

/// `-h`, `--help` or `--trezor-key-name=<NAME>`
fn is_adapter_switch(arg: &str) -> bool {
    arg == "-h"
        || arg == "--help"
        || arg
            .strip_prefix(KEY_NAME_FLAG)
            .is_some_and(|rest| rest.starts_with('='))
}
